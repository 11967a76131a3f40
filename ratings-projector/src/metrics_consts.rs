pub const EVENTS_RECEIVED: &str = "projector_events_received_total";
pub const EVENTS_PROJECTED: &str = "projector_events_projected_total";
pub const MALFORMED_ENVELOPES: &str = "projector_malformed_envelopes_total";
pub const INVALID_ENVELOPES: &str = "projector_invalid_envelopes_total";
pub const RETRIES_ATTEMPTED: &str = "projector_retries_attempted_total";
pub const DEAD_LETTERED: &str = "projector_dead_lettered_total";
pub const EMPTY_PAYLOADS: &str = "projector_empty_payloads_total";
pub const PROJECTION_TIME: &str = "projector_projection_duration_seconds";
