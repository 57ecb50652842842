// Scene - the textured sphere the video is projected onto
//
// The viewer sits at the center of a geodesic sphere and sees its inside.
// Texture coordinates are equirectangular: u follows longitude starting
// behind the viewer, v runs from the north pole (0) to the south pole (1).

use std::collections::HashMap;
use std::f32::consts::PI;

use anyhow::anyhow;
use glam::{Mat4, Vec3};

use crate::backend::{ExternalTexture, GraphicsDevice, MeshData, MeshId, Vertex, ViewId};
use crate::error::GpuError;

pub const DEFAULT_RADIUS: f32 = 10.0;
pub const DEFAULT_TESSELLATION: u32 = 5;
/// 524288 triangles; every further level quadruples the mesh.
pub const MAX_TESSELLATION: u32 = 8;

const OCTAHEDRON_VERTICES: [Vec3; 6] = [
    Vec3::Y,
    Vec3::NEG_Z,
    Vec3::X,
    Vec3::Z,
    Vec3::NEG_X,
    Vec3::NEG_Y,
];

const OCTAHEDRON_INDICES: [u32; 24] = [
    0, 1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 1, 5, 1, 4, 5, 4, 3, 5, 3, 2, 5, 2, 1,
];

/// Index of the vertex just pushed.
fn last_index(len: usize) -> Result<u32, GpuError> {
    u32::try_from(len - 1).map_err(|_| GpuError::IndexOverflow(len))
}

/// Midpoint of an edge, pushed out to the unit sphere. Shared edges reuse
/// the same vertex.
fn midpoint(
    positions: &mut Vec<Vec3>,
    cache: &mut HashMap<(u32, u32), u32>,
    a: u32,
    b: u32,
) -> Result<u32, GpuError> {
    let key = (a.min(b), a.max(b));
    if let Some(&index) = cache.get(&key) {
        return Ok(index);
    }
    let mid = (positions[a as usize] + positions[b as usize]).normalize();
    positions.push(mid);
    let index = last_index(positions.len())?;
    cache.insert(key, index);
    Ok(index)
}

fn longitude_u(normal: Vec3) -> f32 {
    normal.x.atan2(-normal.z) / (2.0 * PI) + 0.5
}

fn latitude_v(normal: Vec3) -> f32 {
    normal.y.clamp(-1.0, 1.0).acos() / PI
}

/// Geodesic sphere: an octahedron subdivided `tessellation` times, giving
/// `8 * 4^tessellation` triangles.
pub fn geosphere(radius: f32, tessellation: u32) -> Result<MeshData, GpuError> {
    if tessellation > MAX_TESSELLATION {
        return Err(anyhow!(
            "sphere tessellation {} is above the maximum of {}",
            tessellation,
            MAX_TESSELLATION
        )
        .into());
    }
    let mut positions = OCTAHEDRON_VERTICES.to_vec();
    let mut indices = OCTAHEDRON_INDICES.to_vec();

    for _ in 0..tessellation {
        let mut cache = HashMap::new();
        let mut next = Vec::with_capacity(indices.len() * 4);
        for tri in indices.chunks_exact(3) {
            let (a, b, c) = (tri[0], tri[1], tri[2]);
            let ab = midpoint(&mut positions, &mut cache, a, b)?;
            let bc = midpoint(&mut positions, &mut cache, b, c)?;
            let ca = midpoint(&mut positions, &mut cache, c, a)?;
            next.extend_from_slice(&[a, ab, ca, ab, b, bc, ca, bc, c, ab, bc, ca]);
        }
        indices = next;
    }

    let mut vertices: Vec<Vertex> = positions
        .iter()
        .map(|&normal| Vertex {
            position: (normal * radius).to_array(),
            normal: normal.to_array(),
            uv: [longitude_u(normal), latitude_v(normal)],
        })
        .collect();

    fix_seam(&mut vertices, &mut indices)?;
    fix_poles(&mut vertices, &mut indices)?;

    Ok(MeshData { vertices, indices })
}

fn is_pole(v: &Vertex) -> bool {
    v.normal[1].abs() > 1.0 - 1e-6
}

/// Triangles straddling the u=0/1 seam get their low-u corners duplicated
/// with u + 1 so interpolation does not sweep across the whole texture.
fn fix_seam(vertices: &mut Vec<Vertex>, indices: &mut [u32]) -> Result<(), GpuError> {
    let mut wrapped: HashMap<u32, u32> = HashMap::new();
    for tri in indices.chunks_exact_mut(3) {
        let corners = [0, 1, 2].map(|i| vertices[tri[i] as usize]);
        let us = corners.iter().filter(|v| !is_pole(v)).map(|v| v.uv[0]);
        let min = us.clone().fold(f32::INFINITY, f32::min);
        let max = us.fold(f32::NEG_INFINITY, f32::max);
        if max - min <= 0.5 {
            continue;
        }
        for (slot, corner) in tri.iter_mut().zip(corners) {
            if is_pole(&corner) || corner.uv[0] >= 0.5 {
                continue;
            }
            let original = *slot;
            *slot = match wrapped.get(&original) {
                Some(&copy) => copy,
                None => {
                    let mut copy = vertices[original as usize];
                    copy.uv[0] += 1.0;
                    vertices.push(copy);
                    let index = last_index(vertices.len())?;
                    wrapped.insert(original, index);
                    index
                }
            };
        }
    }
    Ok(())
}

/// Pole vertices have no longitude: each pole triangle gets its own copy with
/// u centered between the other two corners. Runs after the seam fix.
fn fix_poles(vertices: &mut Vec<Vertex>, indices: &mut [u32]) -> Result<(), GpuError> {
    for tri in indices.chunks_exact_mut(3) {
        let Some(pole) = (0..3).find(|&i| is_pole(&vertices[tri[i] as usize])) else {
            continue;
        };
        let others = [(pole + 1) % 3, (pole + 2) % 3];
        let u = others
            .iter()
            .map(|&i| vertices[tri[i] as usize].uv[0])
            .sum::<f32>()
            * 0.5;
        let mut copy = vertices[tri[pole] as usize];
        copy.uv[0] = u;
        vertices.push(copy);
        tri[pole] = last_index(vertices.len())?;
    }
    Ok(())
}

/// The drawable: sphere mesh plus the texture bound for the current frame.
#[derive(Debug)]
pub struct SphereScene {
    mesh: MeshId,
    index_count: usize,
    texture: Option<ViewId>,
}

impl SphereScene {
    pub fn create<D: GraphicsDevice>(
        device: &mut D,
        radius: f32,
        tessellation: u32,
    ) -> Result<Self, GpuError> {
        let data = geosphere(radius, tessellation)?;
        let mesh = device.create_mesh(&data)?;
        log::info!(
            "Sphere mesh: radius {}, {} vertices, {} triangles",
            radius,
            data.vertices.len(),
            data.indices.len() / 3
        );
        Ok(Self {
            mesh,
            index_count: data.indices.len(),
            texture: None,
        })
    }

    /// Sample `texture` from now on; the previously bound view is released.
    pub fn bind_texture<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        texture: &ExternalTexture,
    ) -> Result<(), GpuError> {
        let view = device.create_shader_resource_view(texture)?;
        if let Some(previous) = self.texture.replace(view) {
            device.release_view(previous);
        }
        Ok(())
    }

    pub fn draw<D: GraphicsDevice>(
        &self,
        device: &mut D,
        view: Mat4,
        projection: Mat4,
    ) -> Result<(), GpuError> {
        let texture = self
            .texture
            .ok_or_else(|| anyhow!("sphere drawn before a texture was bound"))?;
        device.draw_mesh(self.mesh, texture, view, projection)
    }

    pub fn index_count(&self) -> usize {
        self.index_count
    }

    pub fn destroy<D: GraphicsDevice>(self, device: &mut D) {
        if let Some(texture) = self.texture {
            device.release_view(texture);
        }
        device.release_mesh(self.mesh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GraphicsApi, NullGraphics, TextureFormat};

    const EPSILON: f32 = 1e-4;

    #[test]
    fn test_triangle_count() {
        for tessellation in 0..4 {
            let mesh = geosphere(1.0, tessellation).unwrap();
            assert_eq!(mesh.indices.len() / 3, 8 * 4usize.pow(tessellation));
        }
    }

    #[test]
    fn test_tessellation_is_bounded() {
        assert!(geosphere(1.0, MAX_TESSELLATION + 1).is_err());

        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        assert!(SphereScene::create(&mut device, DEFAULT_RADIUS, 16).is_err());
        assert!(api.stats().meshes.is_empty());
    }

    #[test]
    fn test_index_overflow_is_reported() {
        assert_eq!(last_index(1).unwrap(), 0);
        assert_eq!(last_index(u32::MAX as usize + 1).unwrap(), u32::MAX);
        let err = last_index(u32::MAX as usize + 2).unwrap_err();
        assert!(matches!(err, GpuError::IndexOverflow(n) if n == u32::MAX as usize + 2));
    }

    #[test]
    fn test_vertices_on_sphere() {
        let mesh = geosphere(DEFAULT_RADIUS, 3).unwrap();
        for v in &mesh.vertices {
            let len = Vec3::from(v.position).length();
            assert!((len - DEFAULT_RADIUS).abs() < EPSILON * DEFAULT_RADIUS);
            assert!((0.0..=1.0).contains(&v.uv[1]));
        }
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn test_forward_is_texture_center() {
        assert!((longitude_u(Vec3::NEG_Z) - 0.5).abs() < EPSILON);
        assert!((latitude_v(Vec3::NEG_Z) - 0.5).abs() < EPSILON);
        assert!((longitude_u(Vec3::X) - 0.75).abs() < EPSILON);
        assert!(latitude_v(Vec3::Y).abs() < EPSILON);
    }

    #[test]
    fn test_no_triangle_spans_seam() {
        let mesh = geosphere(1.0, 3).unwrap();
        for tri in mesh.indices.chunks_exact(3) {
            let us: Vec<f32> = tri.iter().map(|&i| mesh.vertices[i as usize].uv[0]).collect();
            let min = us.iter().copied().fold(f32::INFINITY, f32::min);
            let max = us.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert!(max - min <= 0.5, "{us:?}");
        }
    }

    #[test]
    fn test_bind_releases_previous_view() {
        let mut api = NullGraphics::new();
        let mut device = api.create_device(None).unwrap();
        let mut scene = SphereScene::create(&mut device, DEFAULT_RADIUS, 1).unwrap();
        assert!(scene.draw(&mut device, Mat4::IDENTITY, Mat4::IDENTITY).is_err());

        let frame = ExternalTexture {
            handle: 99,
            width: 64,
            height: 32,
            format: TextureFormat::Rgba8Unorm,
        };
        scene.bind_texture(&mut device, &frame).unwrap();
        scene.bind_texture(&mut device, &frame).unwrap();
        assert_eq!(api.stats().views.len(), 1);
        scene.draw(&mut device, Mat4::IDENTITY, Mat4::IDENTITY).unwrap();
        assert_eq!(api.stats().draw_count(), 1);

        scene.destroy(&mut device);
        assert!(api.stats().is_empty());
        assert_eq!(api.stats().bad_releases, 0);
    }
}
