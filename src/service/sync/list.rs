use std::{cmp::Ordering, collections::BTreeSet};

use crate::{
	cache::Cache,
	sync::request::{ListRequest, SortBy, SyncRequest},
};

/// One list resolved against the current world: the full filtered count
/// plus the rooms that fall inside the requested ranges, in sort order.
#[derive(Debug)]
pub(super) struct ResolvedList {
	pub(super) count: usize,
	pub(super) windowed: Vec<String>,
}

/// Interpret every declared list against the freshly sorted room list for
/// this user. The same room may appear in several lists; the caller
/// flattens the windows into one visible set.
pub(super) fn resolve_lists(cache: &Cache, user_id: &str, request: &SyncRequest) -> Vec<ResolvedList> {
	request
		.lists
		.iter()
		.map(|list| resolve_list(cache, user_id, list))
		.collect()
}

pub(super) fn visible_rooms(lists: &[ResolvedList]) -> BTreeSet<String> {
	lists
		.iter()
		.flat_map(|list| list.windowed.iter().cloned())
		.collect()
}

fn resolve_list(cache: &Cache, user_id: &str, list: &ListRequest) -> ResolvedList {
	let filters = list.filters.clone().unwrap_or_default();

	let mut rooms: Vec<String> = match filters.is_invite {
		| Some(true) => cache.invited_rooms(user_id),
		| Some(false) => cache.joined_rooms(user_id),
		| None => {
			let mut rooms = cache.joined_rooms(user_id);
			rooms.extend(cache.invited_rooms(user_id));
			rooms
		},
	};

	if let Some(pattern) = &filters.room_name_like {
		let needle = pattern.to_lowercase();
		rooms.retain(|room_id| {
			cache
				.room_name(room_id)
				.unwrap_or_default()
				.to_lowercase()
				.contains(&needle)
		});
	}

	let sort = list.sort.first().copied().unwrap_or(SortBy::ByRecency);
	match sort {
		| SortBy::ByRecency => rooms.sort_by(|a, b| {
			// newest first; fall back to the id for a stable total order
			match cache.room_recency(b).cmp(&cache.room_recency(a)) {
				| Ordering::Equal => a.cmp(b),
				| other => other,
			}
		}),
		| SortBy::ByName => rooms.sort_by_key(|room_id| {
			(cache.room_name(room_id).unwrap_or_else(|| room_id.clone()), room_id.clone())
		}),
	}

	let count = rooms.len();
	let mut windowed = Vec::new();
	let mut seen = BTreeSet::new();
	for &(start, end) in &list.ranges {
		if start >= rooms.len() || end < start {
			continue;
		}

		let end = end.min(rooms.len().saturating_sub(1));
		for room_id in &rooms[start..=end] {
			if seen.insert(room_id.clone()) {
				windowed.push(room_id.clone());
			}
		}
	}

	ResolvedList { count, windowed }
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::{resolve_lists, visible_rooms};
	use crate::{
		cache::Cache,
		storage::{Storage, tests::event},
		sync::request::{ListRequest, SyncRequest},
	};

	fn seeded_cache(rooms: &[&str]) -> Cache {
		let storage = Arc::new(Storage::new());
		let cache = Cache::new(storage.clone());
		for room_id in rooms {
			let (position, events) = storage
				.accumulate(room_id, &[event(&format!("${room_id}"), "m.room.message", None)])
				.unwrap();
			cache.on_joined_room("@u:x", room_id);
			cache.on_timeline(room_id, &events, position);
		}

		cache
	}

	fn request(ranges: Vec<(usize, usize)>) -> SyncRequest {
		SyncRequest {
			lists: vec![ListRequest { ranges, ..ListRequest::default() }],
			..SyncRequest::default()
		}
	}

	#[test]
	fn recency_sort_puts_newest_first() {
		let cache = seeded_cache(&["!old:x", "!new:x"]);
		let lists = resolve_lists(&cache, "@u:x", &request(vec![(0, 10)]));

		assert_eq!(lists[0].count, 2);
		assert_eq!(lists[0].windowed, vec!["!new:x".to_owned(), "!old:x".to_owned()]);
	}

	#[test]
	fn ranges_clamp_to_the_list() {
		let cache = seeded_cache(&["!a:x", "!b:x"]);
		let lists = resolve_lists(&cache, "@u:x", &request(vec![(0, 99)]));
		assert_eq!(lists[0].windowed.len(), 2);

		let lists = resolve_lists(&cache, "@u:x", &request(vec![(5, 9)]));
		assert!(lists[0].windowed.is_empty());
		assert_eq!(lists[0].count, 2);
	}

	#[test]
	fn overlapping_ranges_do_not_duplicate() {
		let cache = seeded_cache(&["!a:x", "!b:x", "!c:x"]);
		let lists = resolve_lists(&cache, "@u:x", &request(vec![(0, 1), (1, 2)]));
		assert_eq!(lists[0].windowed.len(), 3);

		let visible = visible_rooms(&lists);
		assert_eq!(visible.len(), 3);
	}
}
