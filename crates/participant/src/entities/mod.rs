pub mod data_channel;
pub mod media_track;
pub mod subscribed_track;
pub mod transport;
