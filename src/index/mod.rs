pub mod bloom;
pub mod dimension;
pub mod multiset;
pub mod ostree;
pub mod trigram;
pub mod zonemap;
