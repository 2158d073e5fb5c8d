//! The basic good.
//!
//! A good is little more than a uniquely identified member with an optional
//! name; bundles reference goods by their member id.  The `atom` is the
//! smallest increment a discrete good comes in (0 for the default,
//! continuous case).  The kernel does not enforce it; callers that model
//! discrete goods can.

use crate::id::GoodId;
use crate::member::{Member, MemberClass, MemberCore};

pub struct Good {
    core: MemberCore,
    pub name: String,
    atom: f64,
}

impl Good {
    /// A continuous good with the given name (may be empty).
    pub fn new(name: impl Into<String>) -> Good {
        Good {
            core: MemberCore::new(),
            name: name.into(),
            atom: 0.0,
        }
    }

    /// A discrete good that comes in multiples of `atom`.
    pub fn discrete(name: impl Into<String>, atom: f64) -> Good {
        Good {
            core: MemberCore::new(),
            name: name.into(),
            atom,
        }
    }

    /// The good's id, usable as a bundle key.
    pub fn id(&self) -> GoodId {
        self.core.id()
    }

    /// The smallest increment of this good; 0 for continuous goods.
    pub fn atom(&self) -> f64 {
        self.atom
    }
}

impl Member for Good {
    fn core(&self) -> &MemberCore {
        &self.core
    }

    fn classify(&self) -> MemberClass {
        MemberClass::Good
    }
}
