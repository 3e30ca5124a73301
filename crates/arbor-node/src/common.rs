use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_broker::{AttributeFilter, Attributes};

/// Setup Ctrl+C handler, returns a flag that goes false on signal.
pub fn setup_ctrlc() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\nCtrl+C received, shutting down...");
        r.store(false, Ordering::Relaxed);
    });
    running
}

/// Parse `key=value` arguments into an equality filter.
pub fn parse_filter(pairs: &[String]) -> anyhow::Result<AttributeFilter> {
    AttributeFilter::from_pairs(pairs.iter().map(String::as_str))
        .ok_or_else(|| anyhow::anyhow!("invalid filter {pairs:?}: expected key=value"))
}

/// Parse `key=value` arguments into message content.
pub fn parse_attributes(pairs: &[String]) -> anyhow::Result<Attributes> {
    Attributes::from_pairs(pairs.iter().map(String::as_str))
        .ok_or_else(|| anyhow::anyhow!("invalid attributes {pairs:?}: expected key=value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_parse_with_inferred_types() {
        let args = vec!["type=temp".to_string(), "value=21".to_string()];
        let attrs = parse_attributes(&args).unwrap();
        assert!(parse_filter(&args).unwrap().matches_attributes(&attrs));
        assert!(parse_filter(&["novalue".to_string()]).is_err());
    }
}
