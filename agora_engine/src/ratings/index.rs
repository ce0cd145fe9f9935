use std::collections::BTreeMap;

use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    db::StoreTx,
    ratings::{Rating, RatingError},
};

pub const RATING_INDEX_PATH: &str = "ratings/index.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingIndexEntry {
    pub count: u64,
    pub average: f64,
    /// Hashes of the per-rating files under `ratings/`.
    pub ratings: Vec<String>,
}

/// The published summary of a vendor's ratings, keyed by listing slug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatingIndex(BTreeMap<String, RatingIndexEntry>);

impl RatingIndex {
    pub async fn load(tx: &mut StoreTx) -> Result<Self, RatingError> {
        match tx.read_public_file(RATING_INDEX_PATH).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Self::default()),
        }
    }

    pub fn entry(&self, slug: &str) -> Option<&RatingIndexEntry> {
        self.0.get(slug)
    }

    /// Returns `false` if the rating was already indexed.
    pub fn insert(&mut self, slug: &str, hash: &str, overall: u8) -> bool {
        let entry = self.0.entry(slug.to_string()).or_default();
        if entry.ratings.iter().any(|h| h == hash) {
            return false;
        }
        entry.average = (entry.average * entry.count as f64 + overall as f64) / (entry.count + 1) as f64;
        entry.count += 1;
        entry.ratings.push(hash.to_string());
        true
    }

    /// Adds a verified rating to the index and stages both the rating file and the new index in `tx`.
    pub async fn add_rating(tx: &mut StoreTx, rating: &Rating) -> Result<String, RatingError> {
        let hash = rating.hash()?;
        let mut index = Self::load(tx).await?;
        if index.insert(&rating.rating_data.slug, &hash, rating.rating_data.scores.overall) {
            tx.write_public_file(&format!("ratings/{hash}.json"), serde_json::to_vec_pretty(rating)?)?;
            tx.write_public_file(RATING_INDEX_PATH, serde_json::to_vec_pretty(&index)?)?;
            info!("⭐️ Indexed rating {hash} for {}", rating.rating_data.slug);
        }
        Ok(hash)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn running_average() {
        let mut index = RatingIndex::default();
        assert!(index.insert("chair", "h1", 5));
        assert!(index.insert("chair", "h2", 2));
        assert!(!index.insert("chair", "h2", 2));
        assert!(index.insert("table", "h3", 4));
        let chair = index.entry("chair").unwrap();
        assert_eq!(chair.count, 2);
        assert!((chair.average - 3.5).abs() < 1e-9);
        assert_eq!(index.entry("table").unwrap().ratings, vec!["h3".to_string()]);
        let json = serde_json::to_string(&index).unwrap();
        assert!(json.starts_with("{\"chair\""));
    }
}
