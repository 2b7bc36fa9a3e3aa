pub mod anchor;
pub mod channel;
pub mod state;

pub use anchor::AnchorRepository;
pub use channel::{ChannelRepository, ScheduleRepository};
pub use state::StateStore;
