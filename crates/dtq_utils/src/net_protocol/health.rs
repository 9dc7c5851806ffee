use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Health {
    pub healthy: bool,
    pub version: String,
}

pub fn healthy() -> Health {
    Health {
        healthy: true,
        version: crate::VERSION.to_string(),
    }
}
