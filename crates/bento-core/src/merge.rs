// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Additive default filling.
//!
//! Used once at startup so fields added to the built-in defaults appear in a
//! tree recovered from an older log. Mappings merge recursively; a key that is
//! absent or `null` in the tree takes the default; anything else (including
//! sequences and scalars of a different kind) is left alone. `null` defaults
//! are skipped.

use crate::draft::{Draft, DraftError};
use crate::path::Path;
use crate::value::Value;

/// Fills absent fields of the draft from `defaults`, recording one patch per
/// filled subtree. Returns the number of patches recorded.
///
/// # Errors
/// Propagates [`DraftError`] from the underlying writes; with a mapping at
/// every merged level this does not occur.
pub fn merge_defaults(draft: &mut Draft, defaults: &Value) -> Result<usize, DraftError> {
    let mut filled = 0;
    fill(draft, &Path::root(), defaults, &mut filled)?;
    Ok(filled)
}

fn fill(draft: &mut Draft, at: &Path, default: &Value, filled: &mut usize) -> Result<(), DraftError> {
    if default.is_null() {
        return Ok(());
    }
    let existing_is_mapping = draft.read(at).map(|v| match &*v {
        Value::Null => None,
        Value::Mapping(_) => Some(true),
        _ => Some(false),
    });
    match (existing_is_mapping.flatten(), default) {
        (None, _) => {
            draft.set(at, default.clone())?;
            *filled += 1;
        }
        (Some(true), Value::Mapping(entries)) => {
            for (key, value) in entries {
                fill(draft, &at.child(key), value, filled)?;
            }
        }
        _ => {}
    }
    Ok(())
}
