//! Marketplace statistics

use crate::projection::{Projection, Totals};
use ledger_core::{CharityRef, Currency, MinorUnits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Aggregate marketplace figures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceStats {
    /// Total net raised per currency
    pub total_raised: Totals,
    /// Donations currently counting (net > 0)
    pub active_donations: usize,
    /// Donations fully reversed
    pub reversed_donations: usize,
    /// Charities with at least one entry
    pub charity_count: usize,
    /// Highest-raising charity per currency
    pub top_charity: BTreeMap<Currency, (CharityRef, MinorUnits)>,
}

impl MarketplaceStats {
    /// Compute from a projection
    pub fn from_projection(projection: &Projection) -> Self {
        let mut stats = MarketplaceStats::default();

        for (charity, totals) in projection.charities() {
            stats.charity_count += 1;
            for (currency, amount) in totals {
                *stats.total_raised.entry(*currency).or_insert(0) += amount;

                // Ties go to the lexicographically first charity
                let better = match stats.top_charity.get(currency) {
                    Some((_, best)) => amount > best,
                    None => *amount > 0,
                };
                if better {
                    stats.top_charity.insert(*currency, (charity.clone(), *amount));
                }
            }
        }

        for donation in projection.donations() {
            if donation.net_amount > 0 {
                stats.active_donations += 1;
            } else {
                stats.reversed_donations += 1;
            }
        }

        stats
    }
}

impl fmt::Display for MarketplaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Marketplace Statistics:")?;
        if self.total_raised.is_empty() {
            writeln!(f, "  Total Raised: 0")?;
        }
        for (currency, amount) in &self.total_raised {
            writeln!(f, "  Total Raised: {} {}", currency.to_major(*amount), currency)?;
        }
        writeln!(f, "  Total Charities: {}", self.charity_count)?;
        writeln!(f, "  Total Donations: {}", self.active_donations)?;
        writeln!(f, "  Reversed Donations: {}", self.reversed_donations)?;
        for (currency, (charity, amount)) in &self.top_charity {
            writeln!(
                f,
                "  Top Charity ({}): {} ({} {})",
                currency,
                charity,
                currency.to_major(*amount),
                currency
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::projection::{project, tests::entry};
    use ledger_core::{CharityRef, Currency, EntryKind};
    use uuid::Uuid;

    #[test]
    fn test_stats_over_mixed_history() {
        let reversed = Uuid::now_v7();
        let projection = project(&[
            entry(0, Uuid::now_v7(), EntryKind::Donation, 5000, "water"),
            entry(1, Uuid::now_v7(), EntryKind::Donation, 7000, "books"),
            entry(2, reversed, EntryKind::Donation, 4000, "water"),
            entry(3, reversed, EntryKind::Compensation, -4000, "water"),
        ])
        .unwrap();

        let stats = projection.stats();
        assert_eq!(stats.total_raised.get(&Currency::USD), Some(&12_000));
        assert_eq!(stats.charity_count, 2);
        assert_eq!(stats.active_donations, 2);
        assert_eq!(stats.reversed_donations, 1);
        assert_eq!(
            stats.top_charity.get(&Currency::USD),
            Some(&(CharityRef::new("books"), 7000))
        );

        let text = stats.to_string();
        assert!(text.contains("Total Raised: 120.00 USD"));
        assert!(text.contains("Top Charity (USD): books (70.00 USD)"));
    }

    #[test]
    fn test_empty_stats() {
        let stats = crate::Projection::new().stats();
        assert_eq!(stats.charity_count, 0);
        assert!(stats.top_charity.is_empty());
    }
}
