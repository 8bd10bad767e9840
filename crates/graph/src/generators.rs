//! Small synthetic graphs for tests, demos and benchmarks.

use trellis_core::VertexId;

use crate::builder::GraphBuilder;

/// Directed ring `0 -> 1 -> ... -> n-1 -> 0`.
pub fn ring<V: Default, E: Default>(n: usize) -> GraphBuilder<V, E> {
    let mut b = GraphBuilder::new();
    let n = n as VertexId;
    for i in 0..n {
        b.add_vertex(i, V::default());
    }
    if n > 1 {
        for i in 0..n {
            b.add_edge(i, (i + 1) % n, E::default());
        }
    }
    b
}

/// Star with `n` vertices: every leaf `1..n` points at center `0`.
pub fn star<V: Default, E: Default>(n: usize) -> GraphBuilder<V, E> {
    let mut b = GraphBuilder::new();
    let n = n as VertexId;
    for i in 0..n {
        b.add_vertex(i, V::default());
    }
    for leaf in 1..n {
        b.add_edge(leaf, 0, E::default());
    }
    b
}

/// `rows x cols` grid with edges pointing right and down.
pub fn grid<V: Default, E: Default>(rows: usize, cols: usize) -> GraphBuilder<V, E> {
    let mut b = GraphBuilder::new();
    let id = |r: usize, c: usize| (r * cols + c) as VertexId;
    for r in 0..rows {
        for c in 0..cols {
            b.add_vertex(id(r, c), V::default());
            if c + 1 < cols {
                b.add_edge(id(r, c), id(r, c + 1), E::default());
            }
            if r + 1 < rows {
                b.add_edge(id(r, c), id(r + 1, c), E::default());
            }
        }
    }
    b
}
