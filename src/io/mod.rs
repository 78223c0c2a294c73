//! I/O: data sources, channel fetching, artifact sink and store setup.

pub mod artifacts;
pub mod fetcher;
pub mod source;
pub mod store;
pub mod volume_store;

pub use artifacts::ArtifactStore;
pub use fetcher::{select_channels, ChannelSelection, DataFetcher};
pub use source::{ChannelInfo, Connector, DataSource, DatasetExtent, MemoryConnector, MemorySource};
pub use store::{create_output_store, create_store, parse_s3_uri, S3Options};
pub use volume_store::{experiment_path, publish_experiment, StoreConnector, StoreSource};
