//! Application identifiers
//!
//! An application is named by up to three fields, rendered as
//! `package_appname_version`. Legacy desktop-file applications carry no
//! package and no version, so the rendered form may be one, two, or three
//! tokens. Fields never contain `_`, whitespace, or control characters.

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AppIdError {
    #[error("Empty application id")]
    Empty,

    #[error("Too many fields in application id '{0}'")]
    TooManyFields(String),

    #[error("Application name missing in '{0}'")]
    MissingAppName(String),

    #[error("Invalid character {1:?} in application id '{0}'")]
    InvalidCharacter(String, char),
}

/// Three-part application identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppID {
    /// Package or container the app ships in (empty for legacy apps)
    pub package: String,
    /// Application name, always present
    pub app_name: String,
    /// Package version or revision (empty for legacy apps)
    pub version: String,
}

impl AppID {
    /// Build an AppID from its fields, validating each one
    pub fn new(package: &str, app_name: &str, version: &str) -> Result<Self, AppIdError> {
        if app_name.is_empty() {
            return Err(AppIdError::MissingAppName(format!(
                "{}_{}_{}",
                package, app_name, version
            )));
        }
        for field in [package, app_name, version] {
            validate_field(field, app_name)?;
        }
        Ok(Self {
            package: package.to_string(),
            app_name: app_name.to_string(),
            version: version.to_string(),
        })
    }

    /// Parse a rendered identifier
    ///
    /// Accepts the full `package_app_version` form, the packageless
    /// `app_version` form, and the bare `app` form used by legacy
    /// desktop-file applications.
    pub fn parse(s: &str) -> Result<Self, AppIdError> {
        if s.is_empty() {
            return Err(AppIdError::Empty);
        }

        let tokens: Vec<&str> = s.split('_').collect();
        let (package, app_name, version) = match tokens.as_slice() {
            [app] => ("", *app, ""),
            [app, version] => ("", *app, *version),
            [package, app, version] => (*package, *app, *version),
            _ => return Err(AppIdError::TooManyFields(s.to_string())),
        };

        if app_name.is_empty() {
            return Err(AppIdError::MissingAppName(s.to_string()));
        }
        for field in [package, app_name, version] {
            validate_field(field, s)?;
        }

        Ok(Self {
            package: package.to_string(),
            app_name: app_name.to_string(),
            version: version.to_string(),
        })
    }

    /// Parse a string that must carry all three fields
    pub fn parse_full(s: &str) -> Result<Self, AppIdError> {
        let appid = Self::parse(s)?;
        if appid.package.is_empty() || appid.version.is_empty() {
            return Err(AppIdError::MissingAppName(s.to_string()));
        }
        Ok(appid)
    }

    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.package.is_empty() && self.app_name.is_empty() && self.version.is_empty()
    }
}

/// Reject characters that would break the rendered form
fn validate_field(field: &str, id: &str) -> Result<(), AppIdError> {
    for ch in field.chars() {
        if ch == '_' || ch.is_whitespace() || ch.is_control() {
            return Err(AppIdError::InvalidCharacter(id.to_string(), ch));
        }
    }
    Ok(())
}

impl fmt::Display for AppID {
    /// Render as `package_app_version`, omitting empty package/version
    /// segments so that every identifier a store produces parses back to
    /// the same value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.package.is_empty() {
            write!(f, "{}_", self.package)?;
        }
        f.write_str(&self.app_name)?;
        if !self.version.is_empty() {
            write!(f, "_{}", self.version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_parts() {
        let appid = AppID::parse("com.example.pkg_myapp_1.2.3").unwrap();
        assert_eq!(appid.package, "com.example.pkg");
        assert_eq!(appid.app_name, "myapp");
        assert_eq!(appid.version, "1.2.3");
    }

    #[test]
    fn test_parse_two_parts() {
        let appid = AppID::parse("myapp_1.0").unwrap();
        assert_eq!(appid.package, "");
        assert_eq!(appid.app_name, "myapp");
        assert_eq!(appid.version, "1.0");
    }

    #[test]
    fn test_parse_bare_name() {
        let appid = AppID::parse("gedit").unwrap();
        assert_eq!(appid.package, "");
        assert_eq!(appid.app_name, "gedit");
        assert_eq!(appid.version, "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AppID::parse("").is_err());
        assert!(AppID::parse("a_b_c_d").is_err());
        assert!(AppID::parse("pkg__1.0").is_err());
        assert!(AppID::parse("pkg_my app_1.0").is_err());
        assert!(AppID::parse("pkg_app\t_1.0").is_err());
        assert!(AppID::parse("pkg_app\x07_1.0").is_err());
    }

    #[test]
    fn test_render_roundtrip_full() {
        let appid = AppID::new("pkg-name", "app-name", "2.0").unwrap();
        assert_eq!(appid.to_string(), "pkg-name_app-name_2.0");
        assert_eq!(AppID::parse(&appid.to_string()).unwrap(), appid);
    }

    #[test]
    fn test_render_roundtrip_legacy() {
        let appid = AppID::new("", "gedit", "").unwrap();
        assert_eq!(appid.to_string(), "gedit");
        assert_eq!(AppID::parse("gedit").unwrap(), appid);

        let versioned = AppID::new("", "gedit", "1.0").unwrap();
        assert_eq!(versioned.to_string(), "gedit_1.0");
        assert_eq!(AppID::parse("gedit_1.0").unwrap(), versioned);
    }

    #[test]
    fn test_parse_full_requires_all_fields() {
        assert!(AppID::parse_full("pkg_app_1.0").is_ok());
        assert!(AppID::parse_full("app_1.0").is_err());
        assert!(AppID::parse_full("app").is_err());
    }

    #[test]
    fn test_new_validates_fields() {
        assert!(AppID::new("pkg", "", "1.0").is_err());
        assert!(AppID::new("pk g", "app", "1.0").is_err());
        assert!(AppID::new("pkg", "app", "1 0").is_err());
    }

    #[test]
    fn test_is_empty() {
        assert!(AppID::default().is_empty());
        assert!(!AppID::new("", "app", "").unwrap().is_empty());
    }
}
