//! Cache key builders shared by the entity services and the invalidation rules.

use crate::models::Table;

/// Single row: `profiles:u1`.
pub fn entity(table: Table, id: &str) -> String {
    format!("{}:{}", table, id)
}

/// Generic listing of a table: `profiles:list`, `profiles:list:<suffix>`.
pub fn list(table: Table) -> String {
    format!("{}:list", table)
}

/// Pattern matching every listing of a table.
pub fn list_pattern(table: Table) -> String {
    format!("{}:list*", table)
}

pub fn leaderboard(limit: usize) -> String {
    format!("leaderboard:top:{}", limit)
}

pub const LEADERBOARD_PATTERN: &str = "leaderboard:*";

/// Challenges a player is part of, as challenger or challenged.
pub fn challenges_for_user(user_id: &str) -> String {
    format!("challenges:user:{}", user_id)
}

pub fn activity_feed(limit: usize) -> String {
    format!("activities:feed:{}", limit)
}

pub const ACTIVITY_FEED_PATTERN: &str = "activities:feed*";

pub fn activities_for_user(user_id: &str) -> String {
    format!("activities:user:{}", user_id)
}

/// Rows of `table` belonging to one user (`notifications:user:u1`, ...).
pub fn user_scoped(table: Table, user_id: &str) -> String {
    format!("{}:user:{}", table, user_id)
}

/// Patterns covering `key` itself and anything nested under it (`key:...`),
/// without catching siblings that merely share a prefix (`u1` vs `u10`).
pub fn family(key: &str) -> [String; 2] {
    [key.to_string(), format!("{}:*", key)]
}

/// Glob match where `*` matches any run of characters. A pattern without `*`
/// must equal the key.
pub fn matches_pattern(key: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return key == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return false,
    };
    let Some(mut remaining) = key.strip_prefix(first) else {
        return false;
    };

    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return remaining.is_empty(),
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_without_wildcard() {
        assert!(matches_pattern("profiles:u1", "profiles:u1"));
        assert!(!matches_pattern("profiles:u10", "profiles:u1"));
    }

    #[test]
    fn test_prefix_pattern() {
        assert!(matches_pattern("leaderboard:top:10", LEADERBOARD_PATTERN));
        assert!(matches_pattern("activities:feed:20", ACTIVITY_FEED_PATTERN));
        assert!(matches_pattern("profiles:list", &list_pattern(Table::Profiles)));
        assert!(!matches_pattern("profiles:u1", &list_pattern(Table::Profiles)));
    }

    #[test]
    fn test_inner_wildcard() {
        assert!(matches_pattern("challenges:user:a:open", "challenges:*:open"));
        assert!(!matches_pattern("challenges:user:a:closed", "challenges:*:open"));
        assert!(matches_pattern("anything", "*"));
    }

    #[test]
    fn test_builders() {
        assert_eq!(entity(Table::Profiles, "u1"), "profiles:u1");
        assert_eq!(challenges_for_user("a"), "challenges:user:a");
        assert_eq!(user_scoped(Table::Notifications, "a"), "notifications:user:a");
    }

    #[test]
    fn test_family_excludes_prefix_siblings() {
        let [exact, nested] = family(&challenges_for_user("u1"));
        let hits = |key: &str| matches_pattern(key, &exact) || matches_pattern(key, &nested);
        assert!(hits("challenges:user:u1"));
        assert!(hits("challenges:user:u1:open"));
        assert!(!hits("challenges:user:u10"));
    }
}
