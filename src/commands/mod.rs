mod pipeline;
pub mod play;
pub mod replay;
pub mod watch;

pub use play::handle_play;
pub use replay::handle_replay;
pub use watch::handle_watch;
