//! Random run-name generation.
//!
//! Generated names have the form `<adjective>-<noun>`; the manager
//! appends `-<idx>` to make them unique within a project.

use rand::seq::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "daring", "eager", "fancy", "fast",
    "gentle", "golden", "happy", "keen", "lively", "lucid", "mellow", "noble", "quiet", "rapid",
    "shiny", "swift", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "falcon", "otter", "badger", "heron", "lynx", "marmot", "osprey", "panther", "puffin",
    "raven", "salmon", "seal", "shark", "sparrow", "stork", "tapir", "tiger", "toucan", "turtle",
    "walrus", "weasel", "wolf", "wombat", "yak",
];

/// Generate a random `<adjective>-<noun>` base name.
pub fn random_base_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"swift");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"falcon");
    format!("{adjective}-{noun}")
}
