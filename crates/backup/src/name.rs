//! Backup names: `{slug}_{YYYY-MM-DD}_{HH-MM-SS}`, made unique with a numeric
//! suffix (`_2`, `_3`, ...) when two backups of the same source land in the
//! same second.

use rslug::slugify;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::UtcDateTime;
use time::macros::format_description;

/// Highest suffix tried before giving up with a name collision.
pub const MAX_SUFFIX: u32 = 1000;
const FALLBACK_SLUG: &str = "backup";

/// Filesystem-safe form of a folder or file name.
pub fn slug(base: &str) -> String {
    let slug = slugify!(base);
    if slug.is_empty() { FALLBACK_SLUG.to_string() } else { slug }
}

/// The preferred name for a backup of `base` taken at `at`.
pub fn base_name(base: &str, at: UtcDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    // All components are numeric, formatting can't fail.
    let stamp = at.format(&format).unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("{}_{stamp}", slug(base))
}

/// Every name worth trying, in order: the base name, then `_2` up to
/// `_{MAX_SUFFIX}`.
pub fn candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string()).chain((2..=MAX_SUFFIX).map(move |n| format!("{base}_{n}")))
}

/// Names handed out to backups that haven't been recorded yet.
///
/// Two concurrent backups of the same folder would otherwise both pick the
/// same free name before either shows up in the catalog.
#[derive(Debug, Clone, Default)]
pub struct NameReservations(Arc<Mutex<HashSet<String>>>);
impl NameReservations {
    fn names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a name; `None` if someone else already holds it.
    pub fn reserve(&self, name: &str) -> Option<Reservation> {
        if !self.names().insert(name.to_string()) {
            return None;
        }
        Some(Reservation { owner: self.clone(), name: name.to_string() })
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.names().contains(name)
    }
}

/// A claimed name, released when dropped.
#[derive(Debug)]
pub struct Reservation {
    owner: NameReservations,
    name: String,
}
impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }
}
impl Drop for Reservation {
    fn drop(&mut self) {
        self.owner.names().remove(&self.name);
    }
}
