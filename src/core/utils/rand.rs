use rand::{Rng, distributions::Alphanumeric};

/// Random alphanumeric string, used for session identifiers. Session IDs
/// only need to be unguessable in combination with the device binding, but
/// there is no reason to hand out predictable ones.
pub fn string(length: usize) -> String {
	rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(length)
		.map(char::from)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::string;

	#[test]
	fn requested_length_is_respected() {
		assert_eq!(string(16).len(), 16);
		assert_eq!(string(0).len(), 0);
	}

	#[test]
	fn output_is_not_constant() {
		assert_ne!(string(32), string(32));
	}
}
