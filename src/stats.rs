// 📊 Stats Aggregator - combined usage/popularity for a merge keeper
//
// usage:      sum over all members (conservation law)
// popularity: min(100, max over all members + bonus)

use serde::{Deserialize, Serialize};

use crate::entities::LocationNode;

pub const MAX_POPULARITY: u8 = 100;
pub const DEFAULT_POPULARITY_BONUS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedStats {
    pub usage_count: u64,
    pub popularity_score: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsAggregator {
    /// Added to the group's best popularity to reward consolidation
    pub popularity_bonus: u8,
}

impl StatsAggregator {
    pub fn new() -> Self {
        StatsAggregator {
            popularity_bonus: DEFAULT_POPULARITY_BONUS,
        }
    }

    pub fn with_bonus(popularity_bonus: u8) -> Self {
        StatsAggregator { popularity_bonus }
    }

    /// The bonus applies to the group maximum regardless of which member is
    /// the keeper. Empty input yields zeros.
    pub fn aggregate<'a, I>(&self, members: I) -> MergedStats
    where
        I: IntoIterator<Item = &'a LocationNode>,
    {
        let mut usage_count: u64 = 0;
        let mut best: Option<u8> = None;

        for member in members {
            usage_count = usage_count.saturating_add(member.usage_count);
            best = Some(best.map_or(member.popularity_score, |b| b.max(member.popularity_score)));
        }

        let popularity_score = match best {
            Some(max) => max.saturating_add(self.popularity_bonus).min(MAX_POPULARITY),
            None => 0,
        };

        MergedStats {
            usage_count,
            popularity_score,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::LocationType;

    fn member(popularity: u8, usage: u64) -> LocationNode {
        LocationNode::new("El Millón", LocationType::Sector, None).with_stats(popularity, usage)
    }

    #[test]
    fn test_usage_is_summed() {
        let members = vec![member(40, 5), member(70, 12)];
        let stats = StatsAggregator::new().aggregate(&members);
        assert_eq!(stats.usage_count, 17);
    }

    #[test]
    fn test_popularity_is_max_plus_bonus() {
        let members = vec![member(40, 5), member(70, 12)];
        let stats = StatsAggregator::new().aggregate(&members);
        assert_eq!(stats.popularity_score, 75);
    }

    #[test]
    fn test_popularity_is_clamped() {
        let members = vec![member(98, 0), member(10, 0)];
        assert_eq!(StatsAggregator::new().aggregate(&members).popularity_score, 100);

        let members = vec![member(100, 0)];
        assert_eq!(
            StatsAggregator::with_bonus(u8::MAX).aggregate(&members).popularity_score,
            100
        );
    }

    #[test]
    fn test_empty_members() {
        let members: Vec<LocationNode> = Vec::new();
        let stats = StatsAggregator::new().aggregate(&members);
        assert_eq!(
            stats,
            MergedStats {
                usage_count: 0,
                popularity_score: 0
            }
        );
    }

    #[test]
    fn test_usage_saturates() {
        let members = vec![member(1, u64::MAX), member(1, 10)];
        assert_eq!(StatsAggregator::new().aggregate(&members).usage_count, u64::MAX);
    }
}
