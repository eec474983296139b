use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Profile {
    pub id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
}

impl Profile {
    pub fn new(id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: Some(full_name.into()),
            ..Default::default()
        }
    }

    /// Full name, falling back to the local part of the email.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.full_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// The signed-in user as reported by the auth collaborator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub profile: Profile,
}

impl AuthUser {
    pub fn new(profile: Profile) -> Self {
        Self {
            id: profile.id.clone(),
            profile,
        }
    }

    pub fn display_name(&self) -> String {
        self.profile.display_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallbacks() {
        let named = Profile::new("u1", "Ada Lovelace");
        assert_eq!(named.display_name(), "Ada Lovelace");

        let email_only = Profile {
            id: "u2".to_string(),
            full_name: Some("   ".to_string()),
            email: Some("grace@school.edu".to_string()),
            ..Default::default()
        };
        assert_eq!(email_only.display_name(), "grace");

        let anonymous = Profile {
            id: "u3".to_string(),
            ..Default::default()
        };
        assert_eq!(anonymous.display_name(), "Unknown");
    }
}
