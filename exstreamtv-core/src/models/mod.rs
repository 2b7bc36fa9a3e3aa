pub mod channel;
pub mod id;
pub mod media;
pub mod playout;
pub mod schedule;
pub mod session;

pub use channel::{Channel, StreamingMode, ThrottleMode, ThrottlerConfig};
pub use id::{ChannelId, LeaseId, SessionId};
pub use media::{MediaItem, MediaRef};
pub use playout::{FillerKind, PlayoutAnchor, PlayoutItem};
pub use schedule::{
    BalanceConfig, ContentSource, PickerConfig, ProgramSchedule, ScheduleItem, SlotFlexMode,
    SlotOrderMode, SlotPaddingMode, TimeSlot, TimeSlotSchedule, DAY_ALL,
};
pub use session::{Session, SessionState};
