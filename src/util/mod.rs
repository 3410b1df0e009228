pub mod arena;
pub mod buf_ext;
pub mod id;
pub mod isolate;
