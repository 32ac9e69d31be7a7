pub mod codec;
pub mod framer;
