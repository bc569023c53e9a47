//! Ownership marker for distributed VMs
//!
//! A distributed VM carries a line `origin=<template>/<image>` in its
//! description. That line is the only record of which distributor
//! produced it, so all reading and writing of it lives here.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

const TAG_KEY: &str = "origin";

/// Identifies VMs produced from a given template and disk image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnershipTag {
    pub template: u32,
    pub image: u32,
}

impl OwnershipTag {
    pub fn new(template: u32, image: u32) -> Self {
        Self { template, image }
    }

    /// The exact description line
    pub fn line(&self) -> String {
        self.to_string()
    }

    /// True when some line of `description` is exactly this tag
    pub fn is_marked(&self, description: &str) -> bool {
        let line = self.line();
        description.lines().any(|l| l.trim() == line)
    }

    /// Description for a new VM: the source description plus the tag line
    pub fn append_to(&self, description: &str) -> String {
        format!("{}\n{}", description, self.line())
    }

    /// Every tag found in a description
    pub fn find_all(description: &str) -> Vec<OwnershipTag> {
        description
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }
}

impl fmt::Display for OwnershipTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}/{}", TAG_KEY, self.template, self.image)
    }
}

impl FromStr for OwnershipTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Value(format!("not an ownership tag: `{s}`"));

        let value = s
            .strip_prefix(TAG_KEY)
            .and_then(|rest| rest.strip_prefix('='))
            .ok_or_else(invalid)?;
        let (template, image) = value.split_once('/').ok_or_else(invalid)?;

        Ok(Self {
            template: template.parse().map_err(|_| invalid())?,
            image: image.parse().map_err(|_| invalid())?,
        })
    }
}
