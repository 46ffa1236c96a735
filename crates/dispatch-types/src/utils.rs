//! Utility functions shared across the dispatch crates.

/// Truncates an id for display purposes.
///
/// Shows only the first 8 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	if id.len() <= 8 {
		id.to_string()
	} else {
		format!("{}..", &id[..8])
	}
}

/// Current UNIX timestamp in seconds; 0 if the clock is before the epoch.
pub fn current_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn truncates_long_ids() {
		assert_eq!(truncate_id("abc"), "abc");
		assert_eq!(truncate_id("12345678"), "12345678");
		assert_eq!(truncate_id("123456789abcdef"), "12345678..");
	}
}
