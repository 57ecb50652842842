// Frame pipeline - one call renders both eyes, submits, mirrors, presents
//
// Per frame:
//   state check -> resolve decoded surface -> camera update -> timing + tracking samples
//   -> bind video texture -> for each eye: advance ring, clear, draw
//   -> one stereo layer submit -> mirror copy to backbuffer -> present

use crate::backend::{GraphicsApi, GraphicsDevice};
use crate::device::{DeviceState, VrDevice};
use crate::error::{AllocatorError, DeviceError, GpuError};
use crate::hmd::{self, Eye, HmdRuntime, HmdSession, LayerEyeFov};
use crate::pose;

pub use crate::backend::ExternalTexture;

/// Identifier of a decoded surface inside the external allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemId(pub u64);

/// A decoded video frame as handed over by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSurface {
    pub mem_id: MemId,
}

/// Resolves decoded surfaces to textures the device can sample.
pub trait FrameAllocator {
    /// The returned texture stays valid until the same surface is asked for again.
    fn get_hdl(&mut self, mem_id: MemId) -> Result<ExternalTexture, AllocatorError>;
}

impl<A: GraphicsApi, R: HmdRuntime> VrDevice<A, R> {
    /// Render `surface` to both eyes, hand the layer to the compositor and
    /// present the mirror. Nothing reaches the GPU if the surface cannot be
    /// resolved, and nothing reaches the allocator unless the device is ready.
    ///
    /// Each phase runs inside its own `tracing` span: `clear_buffers` and
    /// `draw_sphere` once per eye, then `submit_frame`, `copy_mirror` and
    /// `present`, all nested under one `render_frame` span.
    pub fn render_frame<F>(
        &mut self,
        surface: &FrameSurface,
        allocator: &mut F,
    ) -> Result<(), DeviceError>
    where
        F: FrameAllocator + ?Sized,
    {
        let invalid = || DeviceError::InvalidState {
            operation: "render_frame",
            state: self.state,
        };
        if !matches!(self.state, DeviceState::Initialized | DeviceState::Rendering) {
            return Err(invalid());
        }

        let _frame = tracing::debug_span!("render_frame", frame_index = self.frame_index).entered();

        let texture = allocator
            .get_hdl(surface.mem_id)
            .map_err(|source| DeviceError::Allocator {
                mem_id: surface.mem_id,
                source,
            })?;

        let (Some(gpu), Some(session), Some(scene), Some(mirror), Some(eye_desc)) = (
            self.gpu.as_mut(),
            self.session.as_mut(),
            self.scene.as_mut(),
            self.mirror.as_ref(),
            self.eye_render_desc,
        ) else {
            return Err(invalid());
        };
        let [Some(left_ring), Some(right_ring)] = &mut self.eye_surfaces else {
            return Err(invalid());
        };
        let [Some(left_depth), Some(right_depth)] = &self.depth_surfaces else {
            return Err(invalid());
        };
        let (Some(backbuffer), Some(_)) = (gpu.device.backbuffer(), gpu.backbuffer_view) else {
            return Err(GpuError::NoSwapchain.into());
        };

        self.camera
            .update(&self.input, self.settings.move_step, self.settings.turn_step);

        // Sampling order matters: display time, sensor time, then tracking
        let display_time = session.predicted_display_time(self.frame_index)?;
        let sensor_time = session.time_in_seconds();
        let tracking = session.tracking_state(display_time, true);
        let eye_poses = hmd::calc_eye_poses(
            &tracking.head_pose,
            &eye_desc.map(|desc| desc.hmd_to_eye_offset),
        );

        scene.bind_texture(&mut gpu.device, &texture)?;

        let camera = self.camera.pose();
        let mut eyes = [(left_ring, left_depth), (right_ring, right_depth)];
        for (eye, (target_ring, depth)) in Eye::ALL.into_iter().zip(eyes.iter_mut()) {
            let i = eye.index();
            let target = target_ring.advance();
            {
                let _span = tracing::debug_span!("clear_buffers", ?eye).entered();
                gpu.device.set_render_target(target.rtv, Some(depth.view()))?;
                gpu.device
                    .clear_render_target(target.rtv, self.settings.clear_color)?;
                gpu.device.clear_depth_stencil(depth.view(), 1.0, 0)?;
            }

            let _span = tracing::debug_span!("draw_sphere", ?eye).entered();
            gpu.device.set_viewport(self.viewports[i].into())?;
            let matrices = pose::eye_matrices(&camera, &eye_poses[i], &eye_desc[i].fov);
            scene.draw(&mut gpu.device, matrices.view, matrices.projection)?;
        }

        let layer = LayerEyeFov {
            color_texture: eyes.map(|(ring, _)| ring.submit_ref()),
            viewport: self.viewports,
            fov: eye_desc.map(|desc| desc.fov),
            render_pose: eye_poses,
            sensor_sample_time: sensor_time,
        };
        tracing::debug_span!("submit_frame")
            .in_scope(|| session.submit_frame(&mut gpu.device, self.frame_index, &[layer]))?;

        tracing::debug_span!("copy_mirror")
            .in_scope(|| gpu.device.copy_texture(backbuffer, mirror.texture))?;
        tracing::debug_span!("present").in_scope(|| gpu.device.present(0))?;

        self.frame_index += 1;
        self.state = DeviceState::Rendering;
        Ok(())
    }
}
