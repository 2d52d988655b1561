// ==== Ingestion loop metrics ====
/// Counter for messages read from the queue
pub const MESSAGES_RECEIVED: &str = "archiver_messages_received_total";

/// Counter for messages dropped before reaching the accumulator, labelled by reason
pub const MESSAGES_DROPPED: &str = "archiver_messages_dropped_total";

/// Counter for poll errors, labelled by kafka error kind and severity
pub const POLL_ERRORS: &str = "archiver_poll_errors_total";

/// Counter for flushes, labelled by trigger (size, age, shutdown)
pub const BATCHES_FLUSHED: &str = "archiver_batches_flushed_total";

/// Histogram for the number of records per flushed batch
pub const BATCH_SIZE: &str = "archiver_batch_size_records";

/// Histogram for the age of a batch when it was flushed
pub const BATCH_AGE: &str = "archiver_batch_age_seconds";

/// Gauge for records currently buffered in the accumulator
pub const BUFFERED_RECORDS: &str = "archiver_buffered_records";

/// Counter for offset commits sent to the queue, labelled by outcome
pub const OFFSET_COMMITS: &str = "archiver_offset_commits_total";

/// Gauge for the current state of the ingestion loop
pub const LOOP_STATE: &str = "archiver_loop_state";

// ==== Offset tracker metrics ====
/// Gauge for the last persisted offset per partition
pub const OFFSET_TRACKER_COMMITTED_OFFSET: &str = "archiver_partition_committed_offset";

/// Counter for offsets read again at or below the committed offset
pub const OFFSET_TRACKER_REDELIVERED: &str = "archiver_redelivered_offsets_total";

// ==== Storage sink metrics ====
/// Counter for objects written to storage
pub const OBJECTS_WRITTEN: &str = "archiver_objects_written_total";

/// Counter for bytes written to storage
pub const OBJECT_BYTES_WRITTEN: &str = "archiver_object_bytes_written_total";

/// Counter for rows written to storage
pub const ROWS_WRITTEN: &str = "archiver_rows_written_total";

/// Counter for failed write attempts, labelled by S3 error reason
pub const WRITE_ATTEMPT_FAILURES: &str = "archiver_write_attempt_failures_total";

/// Histogram for the duration of a whole flush, encode and retries included
pub const FLUSH_DURATION: &str = "archiver_flush_duration_seconds";

/// Histogram for parquet encode time
pub const ENCODE_DURATION: &str = "archiver_encode_duration_seconds";

/// Counter for columns written as text because their values had no common arrow type
pub const ENCODE_TEXT_COLUMNS: &str = "archiver_encode_text_columns_total";

/// Counter for batches re-encoded with every column as text after typed encoding failed
pub const ENCODE_TEXT_FALLBACKS: &str = "archiver_encode_text_fallbacks_total";

/// Counter for flattened keys dropped because another key produced the same column
pub const FLATTEN_COLLISIONS: &str = "archiver_flatten_collisions_total";

// ==== Kafka metrics ====
/// Counter for consumer group rebalance events, labelled by phase
pub const REBALANCE_EVENTS: &str = "archiver_rebalance_events_total";
