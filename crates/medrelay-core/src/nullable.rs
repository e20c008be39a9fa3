//! Field deserializers for records written by other tools, where an absent
//! string is sometimes spelled `null`.

use serde::{Deserialize, Deserializer};

/// `null` reads as the empty string.
pub(crate) fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
