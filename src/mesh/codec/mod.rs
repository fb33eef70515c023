//! C1: framed binary codec. Integer framing (`varint`), frame shapes
//! (`frame`), and the pluggable payload codec (`payload`).

pub mod frame;
pub mod payload;
pub mod varint;
