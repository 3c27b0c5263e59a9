//! API handlers module

pub mod health;
pub mod imports;

#[cfg(test)]
pub(crate) mod testing;
