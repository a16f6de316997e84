use aggr_core::config::AggregatorConfig;
use aggr_core::test_utils::SourceTree;
use std::path::Path;
use std::time::Duration;

/// Configuration serving `sources` from the base url, with state in `work`.
pub fn config_for(sources: &SourceTree, work: &Path) -> AggregatorConfig {
    let mut config = AggregatorConfig {
        name: "integration".to_string(),
        working_dir: work.to_path_buf(),
        base_url: Some(sources.path().to_path_buf()),
        ..Default::default()
    };
    config.options.builder_pool_size = 2;
    config.options.parser_pool_size = 4;
    config.options.delete_delay_secs = 0;
    config
}

/// Number of `*.cache` files in `dir`.
pub fn cache_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "cache"))
                .count()
        })
        .unwrap_or(0)
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
