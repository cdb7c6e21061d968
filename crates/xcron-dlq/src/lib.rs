pub mod codec;
pub mod consume_loop;
pub mod consumer;
pub mod stats;

pub use codec::{
    build_dlq_message, build_dlq_metadata, default_reason_formatter, truncate_reason, DlqMetadata, DlqRecord,
    HEADER_FAILURE_REASON, HEADER_FIRST_FAIL_TIME, HEADER_LAST_FAIL_TIME, HEADER_ORIGINAL_OFFSET,
    HEADER_ORIGINAL_PARTITION, HEADER_ORIGINAL_TOPIC, HEADER_RETRY_COUNT,
};
pub use consume_loop::{consume_step_from_fn, run_consume_loop, ConsumeStep};
pub use consumer::{derive_producer_config, DlqConsumer, DlqConsumerConfig, MessageHandler};
pub use stats::{DlqStats, DlqStatsSnapshot};
