//! Seller records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sellercredit_common::{CreditError, Result, SellerId, UserId};

/// Longest accepted first or last name.
pub const MAX_NAME_LEN: usize = 55;

/// A seller, linked one-to-one to a user identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seller {
    /// Unique seller identifier.
    pub id: SellerId,
    /// Owning user.
    pub user_id: UserId,
    /// Optional first name.
    pub first_name: Option<String>,
    /// Optional last name.
    pub last_name: Option<String>,
    /// When the seller was created.
    pub created_at: DateTime<Utc>,
    /// When the seller was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Seller {
    /// Create a new seller for a user.
    pub fn new(user_id: UserId, first_name: Option<String>, last_name: Option<String>) -> Self {
        let now = Utc::now();

        Self {
            id: SellerId::new(),
            user_id,
            first_name,
            last_name,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace both names and bump `updated_at`.
    pub fn rename(&mut self, first_name: Option<String>, last_name: Option<String>) {
        self.first_name = first_name;
        self.last_name = last_name;
        self.updated_at = Utc::now();
    }

    /// Reject names longer than the stored column allows.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("first_name", &self.first_name), ("last_name", &self.last_name)] {
            if let Some(name) = value {
                if name.chars().count() > MAX_NAME_LEN {
                    return Err(CreditError::invalid_field(
                        field,
                        format!("must be at most {MAX_NAME_LEN} characters"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Display name, falling back to the seller id.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => self.id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let seller = Seller::new(UserId::new(), Some("Sara".into()), Some("Karimi".into()));
        assert_eq!(seller.display_name(), "Sara Karimi");

        let anonymous = Seller::new(UserId::new(), None, None);
        assert_eq!(anonymous.display_name(), anonymous.id.to_string());
    }

    #[test]
    fn test_rename_bumps_updated_at() {
        let mut seller = Seller::new(UserId::new(), Some("Sara".into()), None);
        let created = seller.updated_at;

        seller.rename(None, Some("Karimi".into()));

        assert_eq!(seller.first_name, None);
        assert_eq!(seller.last_name.as_deref(), Some("Karimi"));
        assert!(seller.updated_at >= created);
        assert_eq!(seller.created_at, created);
    }

    #[test]
    fn test_name_length_validation() {
        let seller = Seller::new(UserId::new(), Some("x".repeat(56)), None);
        assert!(matches!(
            seller.validate(),
            Err(CreditError::InvalidField { ref field, .. }) if field == "first_name"
        ));
        assert!(Seller::new(UserId::new(), Some("x".repeat(55)), None)
            .validate()
            .is_ok());
    }
}
