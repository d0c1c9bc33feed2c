//! TUM-format trajectory output.
//!
//! One line per pose: `timestamp tx ty tz qx qy qz qw`, space separated,
//! with `T_wc` in the estimator's world frame.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use tracing::{info, warn};

use crate::geometry::SE3;
use crate::system::output::{OutputSink, PoseUpdate};

/// Which poses end up in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryKind {
    AllFrames,
    KeyframesOnly,
}

/// Sink that keeps the latest estimate of every frame and rewrites the
/// trajectory file on every drain.
pub struct TrajectoryWriter {
    path: PathBuf,
    kind: TrajectoryKind,
    /// Latest pose per frame, ordered by id.
    poses: Vec<PoseUpdate>,
}

impl TrajectoryWriter {
    pub fn new(path: impl Into<PathBuf>, kind: TrajectoryKind) -> Self {
        Self { path: path.into(), kind, poses: Vec::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn selected(&self) -> impl Iterator<Item = &PoseUpdate> {
        let keyframes_only = self.kind == TrajectoryKind::KeyframesOnly;
        self.poses.iter().filter(move |p| !keyframes_only || p.is_keyframe)
    }

    /// Writes the current trajectory, replacing the file.
    pub fn write(&self) -> Result<usize> {
        let mut wtr = WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_path(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        let mut written = 0;
        for p in self.selected() {
            let t = p.pose.translation;
            let q = p.pose.rotation.quaternion();
            wtr.write_record(&[
                format!("{:.6}", p.timestamp_s),
                format!("{:.9}", t.x),
                format!("{:.9}", t.y),
                format!("{:.9}", t.z),
                format!("{:.9}", q.i),
                format!("{:.9}", q.j),
                format!("{:.9}", q.k),
                format!("{:.9}", q.w),
            ])?;
            written += 1;
        }
        wtr.flush()
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(written)
    }
}

impl OutputSink for TrajectoryWriter {
    fn publish_poses(&mut self, poses: &[PoseUpdate]) {
        for update in poses {
            match self.poses.binary_search_by(|p| p.frame_id.cmp(&update.frame_id)) {
                Ok(i) => {
                    let was_keyframe = self.poses[i].is_keyframe;
                    self.poses[i] = PoseUpdate { is_keyframe: was_keyframe || update.is_keyframe, ..*update };
                }
                Err(i) => self.poses.insert(i, *update),
            }
        }
    }

    fn reset(&mut self) {
        self.poses.clear();
    }

    fn drain(&mut self) {
        match self.write() {
            Ok(n) => info!("[TrajectoryWriter] {} poses written to {}", n, self.path.display()),
            Err(err) => warn!("[TrajectoryWriter] {:#}", err),
        }
    }
}

/// One line of a TUM trajectory file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TumEntry {
    pub timestamp_s: f64,
    pub pose: SE3,
}

/// Reads a TUM trajectory file. Lines starting with `#` are skipped.
pub fn load_tum_trajectory(path: impl AsRef<Path>) -> Result<Vec<TumEntry>> {
    let path = path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 8 {
            continue;
        }
        let field = |i: usize| -> Result<f64> {
            rec[i]
                .trim()
                .parse()
                .with_context(|| format!("bad value {:?} in {}", &rec[i], path.display()))
        };
        let translation = Vector3::new(field(1)?, field(2)?, field(3)?);
        let (qx, qy, qz, qw) = (field(4)?, field(5)?, field(6)?, field(7)?);
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
        entries.push(TumEntry { timestamp_s: field(0)?, pose: SE3::new(rotation, translation) });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::FrameId;
    use approx::assert_relative_eq;

    fn update(id: u64, x: f64, is_keyframe: bool) -> PoseUpdate {
        PoseUpdate {
            frame_id: FrameId(id),
            timestamp_s: id as f64 * 0.05,
            pose: SE3::new(
                UnitQuaternion::from_euler_angles(0.1 * id as f64, 0.0, 0.2),
                Vector3::new(x, -x, 0.5),
            ),
            is_keyframe,
            scale_corrected: true,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rust_vio_{}_{}.txt", name, std::process::id()))
    }

    #[test]
    fn drain_writes_latest_poses() {
        let path = temp_path("all");
        let mut writer = TrajectoryWriter::new(&path, TrajectoryKind::AllFrames);
        writer.publish_poses(&[update(0, 0.0, true), update(2, 0.2, false)]);
        writer.publish_poses(&[update(1, 0.1, false), update(2, 0.25, true)]);
        writer.drain();

        let entries = load_tum_trajectory(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_relative_eq!(entries[1].timestamp_s, 0.05, epsilon = 1e-9);
        assert_relative_eq!(entries[2].pose.translation.x, 0.25, epsilon = 1e-9);
        let expected = update(2, 0.25, true).pose.rotation;
        assert!(entries[2].pose.rotation.angle_to(&expected) < 1e-8);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn keyframes_only_filters_and_reset_clears() {
        let path = temp_path("keyframes");
        let mut writer = TrajectoryWriter::new(&path, TrajectoryKind::KeyframesOnly);
        writer.publish_poses(&[update(0, 0.0, true), update(1, 0.1, false), update(3, 0.3, true)]);
        assert_eq!(writer.write().unwrap(), 2);
        let ids: Vec<FrameId> = writer.poses.iter().map(|p| p.frame_id).collect();
        assert_eq!(ids, vec![FrameId(0), FrameId(1), FrameId(3)]);

        writer.reset();
        assert_eq!(writer.write().unwrap(), 0);
        assert!(load_tum_trajectory(&path).unwrap().is_empty());
        std::fs::remove_file(&path).unwrap();
    }
}
