pub mod bidirectional;
pub mod field;
pub mod nnf;
pub mod pyramid;
pub mod remove_object;
mod unsync;
