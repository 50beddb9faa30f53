//! Bounding volume hierarchy backing software acceleration structures.
//!
//! Topology is chosen with a binned surface area heuristic on build.
//! Refit recomputes node bounds bottom-up and never touches topology.

const BINS: usize = 16;
const MAX_LEAF: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    /// Box that contains nothing, including boxes with `min > max`
    /// and boxes with NaN components. Such primitives are inactive.
    pub fn is_empty(&self) -> bool {
        !(0..3).all(|i| self.min[i] <= self.max[i])
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Aabb {
            min: std::array::from_fn(|i| self.min[i].min(other.min[i])),
            max: std::array::from_fn(|i| self.max[i].max(other.max[i])),
        }
    }

    pub fn grow(&mut self, point: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(point[i]);
            self.max[i] = self.max[i].max(point[i]);
        }
    }

    pub fn centroid(&self) -> [f32; 3] {
        if self.is_empty() {
            return [0.0; 3];
        }
        std::array::from_fn(|i| (self.min[i] + self.max[i]) * 0.5)
    }

    fn area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let e: [f32; 3] = std::array::from_fn(|i| self.max[i] - self.min[i]);
        2.0 * (e[0] * e[1] + e[1] * e[2] + e[2] * e[0])
    }

    /// Slab test. Returns entry distance clamped to `t_min`.
    pub fn intersect(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<f32> {
        if self.is_empty() {
            return None;
        }

        let mut near = t_min;
        let mut far = t_max;
        for i in 0..3 {
            let inv = ray.inv_direction[i];
            let mut t0 = (self.min[i] - ray.origin[i]) * inv;
            let mut t1 = (self.max[i] - ray.origin[i]) * inv;

            // Axis-parallel ray through the slab yields NaN.
            if t0.is_nan() || t1.is_nan() {
                if ray.origin[i] < self.min[i] || ray.origin[i] > self.max[i] {
                    return None;
                }
                continue;
            }
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            near = near.max(t0);
            far = far.min(t1);
            if near > far {
                return None;
            }
        }
        Some(near)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: [f32; 3],
    pub direction: [f32; 3],
    pub inv_direction: [f32; 3],
}

impl Ray {
    pub fn new(origin: [f32; 3], direction: [f32; 3]) -> Self {
        Ray {
            origin,
            direction,
            inv_direction: direction.map(|d| 1.0 / d),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Node {
    bounds: Aabb,

    /// First primitive index for leaves, left child for inner nodes.
    first: u32,

    /// Zero for inner nodes. Right child is `first + 1`.
    count: u32,
}

#[derive(Clone, Debug)]
pub struct Bvh {
    nodes: Vec<Node>,
    indices: Vec<u32>,
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: u32,
}

impl Bvh {
    pub fn build(boxes: &[Aabb]) -> Bvh {
        let mut bvh = Bvh {
            nodes: Vec::with_capacity(boxes.len().max(1) * 2),
            indices: (0..boxes.len() as u32).collect(),
        };

        let centroids: Vec<[f32; 3]> = boxes.iter().map(Aabb::centroid).collect();

        bvh.nodes.push(Node {
            bounds: Aabb::EMPTY,
            first: 0,
            count: boxes.len() as u32,
        });

        let mut stack = vec![0usize];
        while let Some(node_idx) = stack.pop() {
            bvh.update_bounds(node_idx, boxes);
            if let Some((left, right)) = bvh.subdivide(node_idx, boxes, &centroids) {
                stack.push(left);
                stack.push(right);
            }
        }

        bvh
    }

    fn update_bounds(&mut self, node_idx: usize, boxes: &[Aabb]) {
        let node = self.nodes[node_idx];
        let mut bounds = Aabb::EMPTY;
        for &prim in &self.indices[node.first as usize..][..node.count as usize] {
            bounds = bounds.union(&boxes[prim as usize]);
        }
        self.nodes[node_idx].bounds = bounds;
    }

    fn subdivide(
        &mut self,
        node_idx: usize,
        boxes: &[Aabb],
        centroids: &[[f32; 3]],
    ) -> Option<(usize, usize)> {
        let node = self.nodes[node_idx];
        if node.count <= MAX_LEAF {
            return None;
        }

        let first = node.first as usize;
        let count = node.count as usize;
        let prims = &self.indices[first..first + count];

        let mut centroid_bounds = Aabb::EMPTY;
        for &prim in prims {
            centroid_bounds.grow(centroids[prim as usize]);
        }

        let extent: [f32; 3] =
            std::array::from_fn(|i| centroid_bounds.max[i] - centroid_bounds.min[i]);
        let axis = if extent[1] > extent[0] && extent[1] >= extent[2] {
            1
        } else if extent[2] > extent[0] {
            2
        } else {
            0
        };

        let split_min = centroid_bounds.min[axis];
        let split_len = extent[axis];
        if !(split_len > 1e-12) {
            // All centroids coincide.
            return self.split_median(node_idx);
        }

        let scale = BINS as f32 / split_len;
        let bin_of = |prim: u32| -> usize {
            let c = centroids[prim as usize][axis];
            (((c - split_min) * scale) as usize).min(BINS - 1)
        };

        let mut bins = [Bin {
            bounds: Aabb::EMPTY,
            count: 0,
        }; BINS];

        for &prim in prims {
            let bin = &mut bins[bin_of(prim)];
            bin.count += 1;
            bin.bounds = bin.bounds.union(&boxes[prim as usize]);
        }

        let mut left_area = [0.0; BINS];
        let mut left_count = [0; BINS];
        let mut acc = Aabb::EMPTY;
        let mut sum = 0;
        for i in 0..BINS {
            sum += bins[i].count;
            acc = acc.union(&bins[i].bounds);
            left_area[i] = acc.area();
            left_count[i] = sum;
        }

        let mut right_area = [0.0; BINS];
        let mut right_count = [0; BINS];
        acc = Aabb::EMPTY;
        sum = 0;
        for i in (0..BINS).rev() {
            sum += bins[i].count;
            acc = acc.union(&bins[i].bounds);
            right_area[i] = acc.area();
            right_count[i] = sum;
        }

        let mut best_cost = f32::INFINITY;
        let mut best_split = None;
        for i in 0..BINS - 1 {
            if left_count[i] == 0 || right_count[i + 1] == 0 {
                continue;
            }
            let cost = left_area[i] * left_count[i] as f32
                + right_area[i + 1] * right_count[i + 1] as f32;
            if cost < best_cost {
                best_cost = cost;
                best_split = Some(i);
            }
        }

        let Some(split) = best_split else {
            return self.split_median(node_idx);
        };

        let prims = &mut self.indices[first..first + count];
        let mut left = 0;
        for i in 0..count {
            if bin_of(prims[i]) <= split {
                prims.swap(i, left);
                left += 1;
            }
        }

        if left == 0 || left == count {
            return self.split_median(node_idx);
        }

        Some(self.push_children(node_idx, left as u32))
    }

    fn split_median(&mut self, node_idx: usize) -> Option<(usize, usize)> {
        let node = self.nodes[node_idx];
        Some(self.push_children(node_idx, node.count / 2))
    }

    fn push_children(&mut self, node_idx: usize, left_count: u32) -> (usize, usize) {
        let node = self.nodes[node_idx];
        let left = self.nodes.len();

        self.nodes.push(Node {
            bounds: Aabb::EMPTY,
            first: node.first,
            count: left_count,
        });
        self.nodes.push(Node {
            bounds: Aabb::EMPTY,
            first: node.first + left_count,
            count: node.count - left_count,
        });

        self.nodes[node_idx].first = left as u32;
        self.nodes[node_idx].count = 0;

        (left, left + 1)
    }

    pub fn primitive_count(&self) -> usize {
        self.indices.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or(Aabb::EMPTY, |n| n.bounds)
    }

    /// Recomputes bounds of every node from new primitive boxes.
    ///
    /// Children are always pushed after their parent,
    /// so a reverse sweep visits them first.
    pub fn refit(&mut self, boxes: &[Aabb]) {
        debug_assert_eq!(boxes.len(), self.indices.len());

        // Empty root is a leaf with zero primitives.
        if self.indices.is_empty() {
            return;
        }

        for node_idx in (0..self.nodes.len()).rev() {
            let node = self.nodes[node_idx];
            let bounds = if node.count > 0 {
                let mut bounds = Aabb::EMPTY;
                for &prim in &self.indices[node.first as usize..][..node.count as usize] {
                    bounds = bounds.union(&boxes[prim as usize]);
                }
                bounds
            } else {
                let left = &self.nodes[node.first as usize];
                let right = &self.nodes[node.first as usize + 1];
                left.bounds.union(&right.bounds)
            };
            self.nodes[node_idx].bounds = bounds;
        }
    }

    /// Finds closest primitive hit in `[t_min, t_max]`.
    ///
    /// `hit` receives primitive index and current closest distance
    /// and returns distance of the hit if any.
    pub fn closest<T>(
        &self,
        ray: &Ray,
        t_min: f32,
        t_max: f32,
        mut hit: impl FnMut(u32, f32) -> Option<(f32, T)>,
    ) -> Option<(f32, T)> {
        let mut best: Option<(f32, T)> = None;
        let mut closest = t_max;

        if self.nodes.is_empty() {
            return None;
        }

        let mut stack = Vec::with_capacity(64);
        stack.push(0u32);

        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx as usize];
            if node.bounds.intersect(ray, t_min, closest).is_none() {
                continue;
            }

            if node.count > 0 {
                for &prim in &self.indices[node.first as usize..][..node.count as usize] {
                    if let Some((t, payload)) = hit(prim, closest) {
                        if t >= t_min && t <= closest {
                            closest = t;
                            best = Some((t, payload));
                        }
                    }
                }
            } else {
                stack.push(node.first);
                stack.push(node.first + 1);
            }
        }

        best
    }
}

/// Möller–Trumbore ray-triangle test without culling.
/// Returns distance and barycentrics of the hit.
pub fn intersect_triangle(ray: &Ray, v: &[[f32; 3]; 3]) -> Option<(f32, [f32; 2])> {
    const EPSILON: f32 = 1e-9;

    let e1 = sub(v[1], v[0]);
    let e2 = sub(v[2], v[0]);
    let p = cross(ray.direction, e2);
    let det = dot(e1, p);
    if det.abs() < EPSILON {
        return None;
    }

    let inv_det = 1.0 / det;
    let s = sub(ray.origin, v[0]);
    let u = dot(s, p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = cross(s, e1);
    let w = dot(ray.direction, q) * inv_det;
    if w < 0.0 || u + w > 1.0 {
        return None;
    }

    let t = dot(e2, q) * inv_det;
    Some((t, [u, w]))
}

pub fn triangle_bounds(v: &[[f32; 3]; 3]) -> Aabb {
    let mut bounds = Aabb::EMPTY;
    for p in v {
        if p.iter().any(|c| !c.is_finite()) {
            return Aabb::EMPTY;
        }
        bounds.grow(*p);
    }
    bounds
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32, y: f32, z: f32) -> Aabb {
        Aabb {
            min: [x, y, z],
            max: [x + 1.0, y + 1.0, z + 1.0],
        }
    }

    fn grid(n: usize) -> Vec<Aabb> {
        (0..n * n)
            .map(|i| unit_box((i % n) as f32 * 2.0, (i / n) as f32 * 2.0, -10.0))
            .collect()
    }

    fn cast(bvh: &Bvh, boxes: &[Aabb], ray: &Ray) -> Option<(f32, u32)> {
        bvh.closest(ray, 0.0, f32::INFINITY, |prim, t_max| {
            boxes[prim as usize]
                .intersect(ray, 0.0, t_max)
                .map(|t| (t, prim))
        })
    }

    #[test]
    fn finds_closest_box() {
        let boxes = grid(32);
        let bvh = Bvh::build(&boxes);
        assert_eq!(bvh.primitive_count(), boxes.len());
        assert!(bvh.node_count() <= 2 * boxes.len() - 1);

        let ray = Ray::new([4.5, 6.5, 0.0], [0.0, 0.0, -1.0]);
        let (t, prim) = cast(&bvh, &boxes, &ray).unwrap();
        assert_eq!(prim, 3 * 32 + 2);
        assert!((t - 9.0).abs() < 1e-5);

        let miss = Ray::new([1.5, 1.5, 0.0], [0.0, 0.0, -1.0]);
        assert!(cast(&bvh, &boxes, &miss).is_none());
    }

    #[test]
    fn refit_tracks_moved_boxes() {
        let mut boxes = grid(16);
        let mut bvh = Bvh::build(&boxes);

        for b in &mut boxes {
            b.min[2] -= 5.0;
            b.max[2] -= 5.0;
        }
        bvh.refit(&boxes);

        let ray = Ray::new([0.5, 0.5, 0.0], [0.0, 0.0, -1.0]);
        let (t, prim) = cast(&bvh, &boxes, &ray).unwrap();
        assert_eq!(prim, 0);
        assert!((t - 14.0).abs() < 1e-5);
        assert_eq!(bvh.bounds().min[2], -15.0);
    }

    #[test]
    fn inactive_boxes_never_hit() {
        let mut boxes = grid(4);
        boxes[0] = Aabb {
            min: [1.0; 3],
            max: [0.0; 3],
        };
        let bvh = Bvh::build(&boxes);
        let ray = Ray::new([0.5, 0.5, 0.0], [0.0, 0.0, -1.0]);
        assert!(cast(&bvh, &boxes, &ray).is_none());
    }

    #[test]
    fn coincident_boxes_split() {
        let boxes = vec![unit_box(0.0, 0.0, 0.0); 100];
        let bvh = Bvh::build(&boxes);
        assert_eq!(bvh.primitive_count(), 100);
        let ray = Ray::new([0.5, 0.5, 5.0], [0.0, 0.0, -1.0]);
        assert!(cast(&bvh, &boxes, &ray).is_some());
    }

    #[test]
    fn triangle_hit() {
        let tri = [[-1.0, -1.0, -2.0], [1.0, -1.0, -2.0], [0.0, 1.0, -2.0]];
        let ray = Ray::new([0.0, 0.0, 0.0], [0.0, 0.0, -1.0]);
        let (t, [u, v]) = intersect_triangle(&ray, &tri).unwrap();
        assert!((t - 2.0).abs() < 1e-6);
        assert!(u >= 0.0 && v >= 0.0 && u + v <= 1.0);

        let ray = Ray::new([3.0, 0.0, 0.0], [0.0, 0.0, -1.0]);
        assert!(intersect_triangle(&ray, &tri).is_none());
    }
}
