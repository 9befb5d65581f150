//! Hook for whatever draws the cable between two attach points.
//!
//! Renderers only receive poses; they never influence link decisions.

use crate::body::Pose;

pub trait LinkRenderer {
    fn start_render(&mut self, from: Pose, to: Pose);

    fn stop_render(&mut self);

    /// Called once per rendered frame while the link is visible.
    fn update_render(&mut self, from: Pose, to: Pose);
}
