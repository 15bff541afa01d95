use crate::error::{Error, Result};

/// A directed dependency structure over data columns: node `i` corresponds
/// to column `i`, and an edge `parent -> child` declares a conditional
/// dependency. Supplied externally and treated as read-only input; the
/// engines only ever query parents and the topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    n_nodes: usize,
    parents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build from an edge list. Node indices must be in range and
    /// self-loops are rejected here; cycles are only detectable globally
    /// and surface from `topological_order`.
    pub fn new(n_nodes: usize, edges: &[(usize, usize)]) -> Result<Self> {
        let mut parents = vec![Vec::new(); n_nodes];
        for &(from, to) in edges {
            if from >= n_nodes || to >= n_nodes {
                return Err(Error::InvalidParameter(format!(
                    "edge ({}, {}) references a node outside 0..{}",
                    from, to, n_nodes
                )));
            }
            if from == to {
                return Err(Error::InvalidParameter(format!(
                    "self-loop on node {}",
                    from
                )));
            }
            if !parents[to].contains(&from) {
                parents[to].push(from);
            }
        }
        Ok(Self { n_nodes, parents })
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn parents(&self, node: usize) -> &[usize] {
        &self.parents[node]
    }

    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (child, ps) in self.parents.iter().enumerate() {
            for &p in ps {
                out.push((p, child));
            }
        }
        out
    }

    /// Kahn's algorithm. Returns an order with parents before children,
    /// or `CyclicGraph` if none exists.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.parents.iter().map(|p| p.len()).collect();
        let mut children = vec![Vec::new(); self.n_nodes];
        for (child, ps) in self.parents.iter().enumerate() {
            for &p in ps {
                children[p].push(child);
            }
        }

        let mut ready: Vec<usize> = (0..self.n_nodes).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.n_nodes);
        while let Some(node) = ready.pop() {
            order.push(node);
            for &c in &children[node] {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.push(c);
                }
            }
        }

        if order.len() != self.n_nodes {
            return Err(Error::CyclicGraph);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topological_order_respects_edges() {
        let g = DependencyGraph::new(4, &[(0, 1), (1, 2), (0, 3)]).unwrap();
        let order = g.topological_order().unwrap();
        let pos = |n: usize| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
        assert!(pos(0) < pos(3));
    }

    #[test]
    fn test_cycle_detected() {
        let g = DependencyGraph::new(3, &[(0, 1), (1, 2), (2, 0)]).unwrap();
        assert!(matches!(g.topological_order(), Err(Error::CyclicGraph)));
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = DependencyGraph::new(2, &[(1, 1)]).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_out_of_range_edge_rejected() {
        let err = DependencyGraph::new(2, &[(0, 5)]).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let g = DependencyGraph::new(2, &[(0, 1), (0, 1)]).unwrap();
        assert_eq!(g.parents(1), &[0]);
    }
}
