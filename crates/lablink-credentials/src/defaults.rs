use crate::types::Credential;
use lablink_core::DefaultLogin;
use std::collections::BTreeMap;

const FALLBACK_CLASS: &str = "default";

/// Default logins per device class, tried only when nothing is cached.
#[derive(Debug, Clone, Default)]
pub struct DeviceClassDefaults {
    by_class: BTreeMap<String, Credential>,
}

impl DeviceClassDefaults {
    pub fn from_config(logins: &BTreeMap<String, DefaultLogin>) -> Self {
        let by_class = logins
            .iter()
            .map(|(class, login)| {
                (
                    class.to_ascii_lowercase(),
                    Credential::new(login.username.clone(), Some(&login.password)),
                )
            })
            .collect();
        Self { by_class }
    }

    /// Default for `class`, or the `"default"` entry when the device has no class.
    pub fn for_class(&self, class: Option<&str>) -> Option<Credential> {
        match class {
            Some(class) => self.by_class.get(&class.to_ascii_lowercase()).cloned(),
            None => self.by_class.get(FALLBACK_CLASS).cloned(),
        }
    }
}
