pub mod audio;
pub mod codec;
pub mod hardware;
pub mod peer;
