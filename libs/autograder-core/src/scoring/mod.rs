/// Final scoring and LMS upload
///
/// **Late policies**: `late` turns raw scores into final scores (baseline rejection,
/// constant or percentage penalties, or a late-days ledger kept on a separate LMS assignment).
///
/// **Upload**: `assignment` compares the final scores against the scoring comments already
/// posted to the LMS and only writes what changed. Locked grades are never touched.
pub mod assignment;
pub mod late;

#[cfg(test)]
mod scoring_tests;

pub use assignment::{full_assignment_scoring_and_upload, parse_comments, ExistingComments};
pub use late::{apply_late_policy, late_days, late_days_with_grace};
