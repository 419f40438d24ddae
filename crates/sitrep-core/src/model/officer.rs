use serde::{Deserialize, Serialize};

use super::incident::Reporter;

/// A field officer on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Officer {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: String,
}

impl Officer {
    /// The denormalized relation embedded on incident records.
    #[must_use]
    pub fn to_reporter(&self) -> Reporter {
        Reporter::new(self.name.clone(), self.phone.clone())
    }
}

/// Sort a roster by display name, then id, the way the desk lists it.
pub fn sort_roster(officers: &mut [Officer]) {
    officers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
}
