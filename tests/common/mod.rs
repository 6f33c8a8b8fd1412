//! Shared fixtures for integration tests.

/// ASCII STL of an axis-aligned box with one corner at the origin.
pub fn box_stl(size: [f64; 3]) -> String {
    let [x, y, z] = size;
    let corners = [
        [0.0, 0.0, 0.0],
        [x, 0.0, 0.0],
        [x, y, 0.0],
        [0.0, y, 0.0],
        [0.0, 0.0, z],
        [x, 0.0, z],
        [x, y, z],
        [0.0, y, z],
    ];
    let faces: [[usize; 3]; 12] = [
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [1, 2, 6],
        [1, 6, 5],
        [2, 3, 7],
        [2, 7, 6],
        [3, 0, 4],
        [3, 4, 7],
    ];
    let mut out = String::from("solid box\n");
    for face in faces {
        out.push_str("  facet normal 0 0 0\n    outer loop\n");
        for i in face {
            let [a, b, c] = corners[i];
            out.push_str(&format!("      vertex {a} {b} {c}\n"));
        }
        out.push_str("    endloop\n  endfacet\n");
    }
    out.push_str("endsolid box\n");
    out
}
