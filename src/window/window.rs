//! The active window: an arena of keyframes (oldest → newest) and the
//! points they host.

use std::collections::BTreeMap;

use tracing::debug;

use super::keyframe::KeyFrame;
use super::point::{Point, PointStatus};
use super::types::{FrameId, PointId};

pub struct ActiveWindow {
    frames: Vec<KeyFrame>,
    points: BTreeMap<PointId, Point>,
    capacity: usize,
    next_point_id: u64,
}

impl ActiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity + 1),
            points: BTreeMap::new(),
            capacity,
            next_point_id: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[KeyFrame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [KeyFrame] {
        &mut self.frames
    }

    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.iter().map(|f| f.id).collect()
    }

    pub fn frame_index(&self, id: FrameId) -> Option<usize> {
        self.frames.binary_search_by_key(&id, |f| f.id).ok()
    }

    pub fn frame(&self, id: FrameId) -> Option<&KeyFrame> {
        self.frame_index(id).map(|i| &self.frames[i])
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut KeyFrame> {
        self.frame_index(id).map(move |i| &mut self.frames[i])
    }

    pub fn newest(&self) -> Option<&KeyFrame> {
        self.frames.last()
    }

    pub fn oldest(&self) -> Option<&KeyFrame> {
        self.frames.first()
    }

    /// Appends a keyframe at the newest end.
    ///
    /// # Panics
    /// If the id does not exceed every id already in the window.
    pub fn insert_frame(&mut self, frame: KeyFrame) {
        if let Some(newest) = self.frames.last() {
            assert!(
                frame.id > newest.id,
                "keyframe {} inserted after {}: ids must increase",
                frame.id,
                newest.id
            );
        }
        debug!("[Window] insert {} ({} frames)", frame.id, self.frames.len() + 1);
        self.frames.push(frame);
    }

    /// Removes a frame from the window. Its hosted points must already have
    /// been removed.
    pub fn remove_frame(&mut self, id: FrameId) -> Option<KeyFrame> {
        let idx = self.frame_index(id)?;
        let frame = self.frames.remove(idx);
        debug_assert!(frame.hosted.iter().all(|p| !self.points.contains_key(p)));
        Some(frame)
    }

    /// True if ids strictly increase from oldest to newest.
    pub fn ids_strictly_increasing(&self) -> bool {
        self.frames.windows(2).all(|w| w[0].id < w[1].id)
    }

    pub fn allocate_point_id(&mut self) -> PointId {
        let id = PointId(self.next_point_id);
        self.next_point_id += 1;
        id
    }

    /// Adds a point and registers it with its host. Returns `false` if the
    /// host is not in the window.
    pub fn add_point(&mut self, point: Point) -> bool {
        let Some(host) = self.frame_mut(point.host) else {
            return false;
        };
        host.hosted.push(point.id);
        self.points.insert(point.id, point);
        true
    }

    /// Removes a point from the arena and from its host's list.
    pub fn remove_point(&mut self, id: PointId) -> Option<Point> {
        let point = self.points.remove(&id)?;
        if let Some(host) = self.frame_mut(point.host) {
            host.hosted.retain(|p| *p != id);
        }
        Some(point)
    }

    pub fn point(&self, id: PointId) -> Option<&Point> {
        self.points.get(&id)
    }

    pub fn point_mut(&mut self, id: PointId) -> Option<&mut Point> {
        self.points.get_mut(&id)
    }

    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    pub fn points_mut(&mut self) -> impl Iterator<Item = &mut Point> {
        self.points.values_mut()
    }

    pub fn point_ids_with_status(&self, status: PointStatus) -> Vec<PointId> {
        self.points
            .values()
            .filter(|p| p.status == status)
            .map(|p| p.id)
            .collect()
    }

    pub fn count_with_status(&self, status: PointStatus) -> usize {
        self.points.values().filter(|p| p.status == status).count()
    }

    /// Number of active points hosted by `frame`.
    pub fn active_hosted(&self, frame: FrameId) -> usize {
        self.frame(frame)
            .map(|f| {
                f.hosted
                    .iter()
                    .filter(|id| self.points.get(id).is_some_and(|p| p.is_active()))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drops every residual of points hosted elsewhere that targets `frame`.
    pub fn drop_residuals_to(&mut self, frame: FrameId) -> usize {
        let mut dropped = 0;
        for point in self.points.values_mut() {
            let before = point.residuals.len();
            point.residuals.retain(|r| r.target != frame);
            dropped += before - point.residuals.len();
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::frame::{ImageAndExposure, ImagePyramid};
    use crate::geometry::SE3;
    use crate::window::keyframe::FrameState;

    fn pyramid() -> Arc<ImagePyramid> {
        let img = ImageAndExposure::new(32, 32, (0..1024).map(|i| ((i * 7) % 255) as f32).collect(), 0.0).unwrap();
        Arc::new(ImagePyramid::build(&img, 1))
    }

    fn keyframe(id: u64) -> KeyFrame {
        KeyFrame::new(FrameId(id), id as f64 * 0.1, pyramid(), FrameState::new(SE3::identity()))
    }

    #[test]
    fn arena_links_points_and_hosts() {
        let mut window = ActiveWindow::new(5);
        window.insert_frame(keyframe(1));
        window.insert_frame(keyframe(4));
        let pid = window.allocate_point_id();
        let point = Point::new_immature(pid, FrameId(4), &window.frame(FrameId(4)).unwrap().pyramid.levels[0], 10.0, 10.0, 50.0).unwrap();
        assert!(window.add_point(point));
        assert_eq!(window.frame(FrameId(4)).unwrap().hosted, vec![pid]);

        window.remove_point(pid);
        assert!(window.frame(FrameId(4)).unwrap().hosted.is_empty());
        assert!(window.remove_frame(FrameId(1)).is_some());
        assert_eq!(window.frame_ids(), vec![FrameId(4)]);
        assert!(window.ids_strictly_increasing());
    }

    #[test]
    #[should_panic(expected = "ids must increase")]
    fn out_of_order_insert_panics() {
        let mut window = ActiveWindow::new(5);
        window.insert_frame(keyframe(3));
        window.insert_frame(keyframe(2));
    }
}
