//! Charity Directory Service boundary
//!
//! The reconciliation engine asks the directory whether a charity is
//! verified before posting a confirmed donation. Onboarding and KYC belong
//! to external services; `InMemoryCharityDirectory` is the registry used by
//! the binary and tests.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledger_core::{CharityRef, MinorUnits};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Charity category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharityCategory {
    /// Schools, literacy, scholarships
    Education,
    /// Conservation, climate
    Environment,
    /// Medical care, research
    Health,
    /// Shelter, homelessness
    Housing,
    /// Animal welfare
    Animals,
    /// Arts and culture
    Arts,
}

impl CharityCategory {
    /// All categories
    pub const ALL: [CharityCategory; 6] = [
        CharityCategory::Education,
        CharityCategory::Environment,
        CharityCategory::Health,
        CharityCategory::Housing,
        CharityCategory::Animals,
        CharityCategory::Arts,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            CharityCategory::Education => "education",
            CharityCategory::Environment => "environment",
            CharityCategory::Health => "health",
            CharityCategory::Housing => "housing",
            CharityCategory::Animals => "animals",
            CharityCategory::Arts => "arts",
        }
    }
}

impl FromStr for CharityCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CharityCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| Error::InvalidCategory(s.to_string()))
    }
}

impl fmt::Display for CharityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory record for one charity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharityRecord {
    /// Reference used on donations
    pub charity_ref: CharityRef,
    /// Display name
    pub name: String,
    /// Category
    pub category: CharityCategory,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Fundraising goal in USD minor units
    #[serde(default)]
    pub goal: MinorUnits,
    /// Passed verification; unverified charities receive no postings
    #[serde(default)]
    pub verified: bool,
    /// Where disbursements go
    #[serde(default)]
    pub payout_account: Option<String>,
    /// Registration time
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

/// Charity Directory Service
#[async_trait]
pub trait CharityDirectory: Send + Sync {
    /// Look up a charity; `None` when unknown
    async fn get_charity(&self, charity_ref: &CharityRef) -> Result<Option<CharityRecord>>;
}

/// In-memory charity registry
#[derive(Debug, Default)]
pub struct InMemoryCharityDirectory {
    charities: DashMap<CharityRef, CharityRecord>,
}

impl InMemoryCharityDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with records (e.g. from configuration)
    pub fn with_records(records: impl IntoIterator<Item = CharityRecord>) -> Self {
        let directory = Self::new();
        for record in records {
            directory.charities.insert(record.charity_ref.clone(), record);
        }
        directory
    }

    /// Register an unverified charity
    pub fn register(
        &self,
        charity_ref: CharityRef,
        name: impl Into<String>,
        category: &str,
        description: impl Into<String>,
        goal: MinorUnits,
    ) -> Result<CharityRecord> {
        let category: CharityCategory = category.parse()?;
        if goal < 0 {
            return Err(Error::Config(format!("goal must not be negative, got {}", goal)));
        }

        let record = CharityRecord {
            charity_ref: charity_ref.clone(),
            name: name.into(),
            category,
            description: description.into(),
            goal,
            verified: false,
            payout_account: None,
            registered_at: Utc::now(),
        };
        self.charities.insert(charity_ref, record.clone());

        tracing::info!(charity_ref = %record.charity_ref, category = %category, "Charity registered");
        Ok(record)
    }

    /// Mark a charity verified and attach its payout account
    pub fn verify(&self, charity_ref: &CharityRef, payout_account: Option<String>) -> Result<CharityRecord> {
        let mut record = self
            .charities
            .get_mut(charity_ref)
            .ok_or_else(|| Error::CharityNotFound(charity_ref.clone()))?;
        record.verified = true;
        if payout_account.is_some() {
            record.payout_account = payout_account;
        }

        tracing::info!(charity_ref = %charity_ref, "Charity verified");
        Ok(record.clone())
    }

    /// Charities, optionally filtered by category, ordered by reference
    pub fn list(&self, category: Option<CharityCategory>) -> Vec<CharityRecord> {
        let mut records: Vec<CharityRecord> = self
            .charities
            .iter()
            .filter(|record| category.map_or(true, |c| record.category == c))
            .map(|record| record.clone())
            .collect();
        records.sort_by(|a, b| a.charity_ref.cmp(&b.charity_ref));
        records
    }

    /// Synchronous lookup
    pub fn get(&self, charity_ref: &CharityRef) -> Option<CharityRecord> {
        self.charities.get(charity_ref).map(|record| record.clone())
    }
}

#[async_trait]
impl CharityDirectory for InMemoryCharityDirectory {
    async fn get_charity(&self, charity_ref: &CharityRef) -> Result<Option<CharityRecord>> {
        Ok(self.get(charity_ref))
    }
}
