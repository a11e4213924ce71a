pub mod controller;
pub mod intent;
pub mod inventory;
pub mod readiness;

#[cfg(test)]
pub mod test_helpers;
