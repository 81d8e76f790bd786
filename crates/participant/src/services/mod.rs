pub mod dtx;
pub mod pli_throttle;
pub mod rtcp_router;
pub mod update_cache;
