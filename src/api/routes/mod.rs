pub mod session;
pub mod squad;
pub mod voice;
