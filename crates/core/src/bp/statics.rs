//! Static direction predictor.
//!
//! Predicts every conditional branch not-taken and keeps no state. Useful
//! as a baseline, and as a cheap early predictor in front of a late
//! predictor.

use crate::uop::Op;

use super::DirPredictor;

/// Stateless always-not-taken predictor.
#[derive(Debug, Default)]
pub struct StaticPredictor;

impl DirPredictor for StaticPredictor {
    fn name(&self) -> &'static str {
        "static"
    }

    fn predict(&mut self, _op: &Op) -> bool {
        false
    }
}
