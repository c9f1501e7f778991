//! 2-D k-d tree over detected source positions.
//!
//! Built once per detection table and queried once per source for the isolation test.

/// A 2-D k-d tree over (x, y) pixel positions.
#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct KdNode {
    /// Index into the points array
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    /// Split dimension (0 = x, 1 = y)
    split_dim: usize,
}

impl KdTree {
    /// Build a balanced tree by median splits. An empty input gives an empty tree.
    pub fn build(points: &[(f64, f64)]) -> Self {
        let points = points.to_vec();
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());

        Self::build_recursive(&points, &mut indices, 0, &mut nodes);

        Self { nodes, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn build_recursive(
        points: &[(f64, f64)],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % 2;
        indices.sort_by(|&a, &b| coord(points[a], split_dim).total_cmp(&coord(points[b], split_dim)));

        let median = indices.len() / 2;
        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let right_indices = &mut right_part[1..];

        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, right_indices, depth + 1, nodes);

        nodes[node_idx].left = left;
        nodes[node_idx].right = right;

        Some(node_idx)
    }

    /// Indices of all points within `radius` of `query` (boundary inclusive), nearest first.
    ///
    /// A query at a stored point always finds that point.
    pub fn radius_search(&self, query: (f64, f64), radius: f64) -> Vec<(usize, f64)> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let radius_sq = radius * radius;
        let mut results = Vec::new();
        self.radius_search_recursive(0, query, radius_sq, &mut results);
        results.sort_by(|a, b| a.1.total_cmp(&b.1));
        results
    }

    /// Number of points within `radius` of `query`
    pub fn count_within(&self, query: (f64, f64), radius: f64) -> usize {
        self.radius_search(query, radius).len()
    }

    fn radius_search_recursive(
        &self,
        node_idx: usize,
        query: (f64, f64),
        radius_sq: f64,
        results: &mut Vec<(usize, f64)>,
    ) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];

        let dist_sq = distance_squared(query, point);
        if dist_sq <= radius_sq {
            results.push((node.point_idx, dist_sq));
        }

        let diff = coord(query, node.split_dim) - coord(point, node.split_dim);
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near_idx) = near {
            self.radius_search_recursive(near_idx, query, radius_sq, results);
        }

        // Points equal on the split axis can sit on either side
        if let Some(far_idx) = far {
            if diff * diff <= radius_sq {
                self.radius_search_recursive(far_idx, query, radius_sq, results);
            }
        }
    }
}

#[inline]
fn coord(point: (f64, f64), dim: usize) -> f64 {
    if dim == 0 {
        point.0
    } else {
        point.1
    }
}

#[inline]
fn distance_squared(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy
}
