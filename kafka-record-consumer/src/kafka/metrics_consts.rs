// ==== Connection metrics ====
/// Counter for messages returned by broker polls
pub const CONNECTION_MESSAGES_POLLED: &str = "record_consumer_messages_polled_total";

/// Counter for Kafka errors seen while polling, labelled by level and error
pub const CONNECTION_KAFKA_ERROR: &str = "record_consumer_kafka_error_total";

/// Counter for rebalance events seen by a connection's context
pub const CONNECTION_REBALANCE_EVENTS: &str = "record_consumer_rebalance_events_total";

// ==== Batch metrics ====
/// Counter for sealed batches handed to the sink
pub const BATCHES_EMITTED: &str = "record_consumer_batches_emitted_total";

/// Histogram for the number of records in a sealed batch
pub const BATCH_RECORD_COUNT: &str = "record_consumer_batch_record_count";

/// Counter for messages routed to the parse failure output
pub const PARSE_FAILURES: &str = "record_consumer_parse_failures_total";

/// Counter for header values that could not be decoded
pub const HEADER_DECODE_FAILURES: &str = "record_consumer_header_decode_failures_total";

// ==== Lease metrics ====
/// Counter for offset commits, labelled by status
pub const LEASE_COMMITS: &str = "record_consumer_lease_commits_total";

/// Counter for messages whose uncommitted state was discarded
pub const LEASE_MESSAGES_DISCARDED: &str = "record_consumer_lease_messages_discarded_total";

/// Counter for forced wakeups sent to leases
pub const LEASE_WAKEUPS: &str = "record_consumer_lease_wakeups_total";

// ==== Pool metrics ====
/// Gauge for leases currently checked out of the pool
pub const POOL_OUTSTANDING_LEASES: &str = "record_consumer_pool_outstanding_leases";

/// Counter for lease requests that found no connection available
pub const POOL_LEASE_MISSES: &str = "record_consumer_pool_lease_misses_total";

/// Counter for connection lifecycle events, labelled by event
pub const POOL_CONNECTION_EVENTS: &str = "record_consumer_pool_connection_events_total";

// ==== Trigger metrics ====
/// Counter for trigger cycles, labelled by outcome
pub const TRIGGER_CYCLES: &str = "record_consumer_trigger_cycles_total";
