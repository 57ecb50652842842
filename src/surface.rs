// Eye render surfaces
//
// Each eye renders into a ring of compositor-owned textures. The compositor
// reads the slot submitted last frame while we write the other one, so the
// ring is advanced before every write and never indexed directly.

use crate::backend::{GraphicsDevice, TextureDesc, TextureFormat, TextureId, TextureUsage, ViewId};
use crate::error::SurfaceError;
use crate::hmd::{HmdSession, SwapTextureRef, SwapTextureSet};

/// Slots the compositor ring must have.
pub const EYE_RING_SIZE: usize = 2;

/// Fixed-capacity ring with a cursor that only moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureRing<T, const N: usize> {
    slots: [T; N],
    current: usize,
}

impl<T, const N: usize> TextureRing<T, N> {
    /// Cursor starts on the last slot so the first `advance` lands on slot 0.
    pub fn new(slots: [T; N]) -> Self {
        Self {
            slots,
            current: N - 1,
        }
    }

    pub fn current(&self) -> &T {
        &self.slots[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) -> &T {
        self.current = (self.current + 1) % N;
        &self.slots[self.current]
    }

    pub fn slots(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

/// One slot of an eye ring: the compositor texture and our view of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EyeTarget {
    pub texture: TextureId,
    pub rtv: ViewId,
}

#[derive(Debug)]
pub struct EyeSurfaceSet {
    set: SwapTextureSet,
    ring: TextureRing<EyeTarget, EYE_RING_SIZE>,
    width: u32,
    height: u32,
}

impl EyeSurfaceSet {
    pub fn create<S, D>(
        session: &mut S,
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<Self, SurfaceError>
    where
        S: HmdSession,
        D: GraphicsDevice,
    {
        let desc = TextureDesc {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::RENDER_TARGET,
        };
        let set = session.create_swap_texture_set(device, &desc)?;

        let textures = set.textures.clone();
        let mut targets = Vec::with_capacity(textures.len());
        for texture in textures {
            match device.create_render_target_view(texture) {
                Ok(rtv) => targets.push(EyeTarget { texture, rtv }),
                Err(e) => {
                    release_targets(device, targets);
                    session.destroy_swap_texture_set(device, set);
                    return Err(e.into());
                }
            }
        }

        let slots: [EyeTarget; EYE_RING_SIZE] = match targets.try_into() {
            Ok(slots) => slots,
            Err(targets) => {
                let actual = targets.len();
                release_targets(device, targets);
                session.destroy_swap_texture_set(device, set);
                return Err(SurfaceError::RingSize {
                    expected: EYE_RING_SIZE,
                    actual,
                });
            }
        };

        log::debug!("Eye ring {:?} created at {}x{}", set.id, width, height);
        Ok(Self {
            set,
            ring: TextureRing::new(slots),
            width,
            height,
        })
    }

    pub fn advance(&mut self) -> EyeTarget {
        *self.ring.advance()
    }

    pub fn current(&self) -> EyeTarget {
        *self.ring.current()
    }

    pub fn current_index(&self) -> usize {
        self.ring.current_index()
    }

    /// Reference the compositor needs to find this frame's image.
    pub fn submit_ref(&self) -> SwapTextureRef {
        SwapTextureRef {
            set: self.set.id,
            index: self.ring.current_index(),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn destroy<S, D>(self, session: &mut S, device: &mut D)
    where
        S: HmdSession,
        D: GraphicsDevice,
    {
        for target in self.ring.slots() {
            device.release_view(target.rtv);
        }
        session.destroy_swap_texture_set(device, self.set);
    }
}

fn release_targets<D: GraphicsDevice>(device: &mut D, targets: Vec<EyeTarget>) {
    for target in targets {
        device.release_view(target.rtv);
    }
}

/// Per-eye depth buffer, sized like the eye ring and never rotated.
#[derive(Debug)]
pub struct DepthSurface {
    texture: TextureId,
    dsv: ViewId,
}

impl DepthSurface {
    pub fn create<D: GraphicsDevice>(
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<Self, SurfaceError> {
        let desc = TextureDesc {
            width,
            height,
            format: TextureFormat::D32Float,
            usage: TextureUsage::DEPTH_STENCIL,
        };
        let texture = device.create_texture(&desc, None)?;
        let dsv = match device.create_depth_stencil_view(texture) {
            Ok(dsv) => dsv,
            Err(e) => {
                device.release_texture(texture);
                return Err(e.into());
            }
        };
        Ok(Self { texture, dsv })
    }

    pub fn view(&self) -> ViewId {
        self.dsv
    }

    pub fn destroy<D: GraphicsDevice>(self, device: &mut D) {
        device.release_view(self.dsv);
        device.release_texture(self.texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GraphicsApi, NullGraphics};
    use crate::hmd::{HmdRuntime, SimulatedHmd, SimulatedHmdConfig};

    #[test]
    fn test_ring_advances_modulo_capacity() {
        let mut ring = TextureRing::new(['a', 'b', 'c']);
        assert_eq!(ring.current_index(), 2);
        assert_eq!(*ring.advance(), 'a');
        assert_eq!(*ring.advance(), 'b');
        assert_eq!(*ring.advance(), 'c');
        assert_eq!(*ring.advance(), 'a');
        assert_eq!(ring.slots().count(), 3);
    }

    #[test]
    fn test_eye_surface_alternates_slots() {
        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        let mut hmd = SimulatedHmd::default();
        hmd.initialize().unwrap();
        let (mut session, _) = hmd.create_session().unwrap();

        let mut eye = EyeSurfaceSet::create(&mut session, &mut device, 64, 32).unwrap();
        let first = eye.advance();
        let second = eye.advance();
        assert_ne!(first, second);
        assert_eq!(eye.advance(), first);
        assert_eq!(eye.submit_ref().index, 0);
        assert_eq!(eye.size(), (64, 32));

        eye.destroy(&mut session, &mut device);
        assert!(api.stats().is_empty());
    }

    #[test]
    fn test_wrong_ring_size_leaks_nothing() {
        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        let mut hmd = SimulatedHmd::new(SimulatedHmdConfig {
            ring_size: 3,
            ..Default::default()
        });
        hmd.initialize().unwrap();
        let (mut session, _) = hmd.create_session().unwrap();

        let err = EyeSurfaceSet::create(&mut session, &mut device, 64, 32).unwrap_err();
        assert!(matches!(err, SurfaceError::RingSize { expected: 2, actual: 3 }));
        assert!(api.stats().is_empty());
        assert_eq!(api.stats().bad_releases, 0);
        assert!(hmd.log().swap_texture_sets.is_empty());
    }

    #[test]
    fn test_short_ring_is_rejected() {
        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        let mut hmd = SimulatedHmd::new(SimulatedHmdConfig {
            ring_size: 1,
            ..Default::default()
        });
        hmd.initialize().unwrap();
        let (mut session, _) = hmd.create_session().unwrap();

        let err = EyeSurfaceSet::create(&mut session, &mut device, 64, 32).unwrap_err();
        assert!(matches!(err, SurfaceError::RingSize { expected: 2, actual: 1 }));
        assert!(api.stats().is_empty());
    }

    #[test]
    fn test_depth_surface_is_d32() {
        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        let depth = DepthSurface::create(&mut device, 64, 32).unwrap();
        {
            let stats = api.stats();
            let desc = stats.textures.values().next().unwrap();
            assert_eq!(desc.format, TextureFormat::D32Float);
            assert_eq!((desc.width, desc.height), (64, 32));
        }
        depth.destroy(&mut device);
        assert!(api.stats().is_empty());
    }
}
