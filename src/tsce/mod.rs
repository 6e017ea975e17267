pub mod bundle;
pub mod collector;
pub mod decorate;
pub mod dispatcher;
pub mod isolated;
pub mod manifest;
pub mod output;
pub mod state;
pub mod summary;

pub use bundle::Bundle;
pub use collector::{CollectionResult, Collector, StopSignal};
pub use decorate::decorate_shard_output;
pub use dispatcher::{BotsResponse, Dispatcher, ShardResult};
pub use isolated::{fetch_isolated_tree, Isolated, IsolatedFile};
pub use manifest::{epoch_millis, ManifestBuilder, TaskManifest, TestSpec};
pub use output::{extract_output_location, OutputLocation};
pub use state::ShardState;
pub use summary::{aggregate_exit_code, Summary};
