pub const FRAMES_RECEIVED: &str = "ais_stream_frames_received";
pub const FRAMES_UNDECODABLE: &str = "ais_stream_frames_undecodable";
pub const MESSAGES_UNHANDLED: &str = "ais_messages_unhandled";
pub const MESSAGES_HANDLED: &str = "ais_messages_handled";
pub const HANDLER_FAILURES: &str = "ais_handler_failures";
pub const STREAM_RECONNECTS: &str = "ais_stream_reconnects";
pub const STREAM_CONNECTION_STATE: &str = "ais_stream_connection_state";

pub const POSITIONS_DISCARDED: &str = "ais_positions_discarded";
pub const POSITIONS_INVALID: &str = "ais_positions_invalid";

pub const HISTORY_ENQUEUED: &str = "ais_history_enqueued";
pub const HISTORY_WRITTEN: &str = "ais_history_written";
pub const HISTORY_DROPPED: &str = "ais_history_dropped";
pub const HISTORY_FLUSH_FAILURES: &str = "ais_history_flush_failures";
pub const HISTORY_FLUSH_TIME: &str = "ais_history_flush_seconds";
pub const HISTORY_BUFFER_DEPTH: &str = "ais_history_buffer_depth";

pub const CACHE_ENTRIES: &str = "ais_cache_entries";
pub const CACHE_EVICTED: &str = "ais_cache_evicted";
