//! Name registry for pluggable predictors.
//!
//! Parameters select predictors by name (`--bp_mech gshare`); the registry
//! turns a name plus the parameter set into a boxed implementation.
//! Algorithm bodies are deliberately pluggable: adding an implementation
//! means adding one arm here.

use crate::common::{FatalError, SimResult};
use crate::config::Params;

use super::btb::GenericBtb;
use super::conf::{ConfMech, ConfTable};
use super::gshare::GsharePredictor;
use super::ibtb::TcTagless;
use super::statics::StaticPredictor;
use super::{BtbModel, ConfEstimator, DirPredictor, IbtbModel};

/// Instantiates a direction predictor by registry name.
pub fn make_dir_predictor(name: &str, params: &Params) -> SimResult<Box<dyn DirPredictor>> {
    match name {
        "gshare" => Ok(Box::new(GsharePredictor::new(
            params.bp.gshare_entries,
            params.bp.global_hist_length,
        ))),
        "static" => Ok(Box::new(StaticPredictor)),
        _ => Err(FatalError::Config(format!(
            "unknown direction predictor '{name}' (expected gshare|static)"
        ))),
    }
}

/// Instantiates a BTB by registry name.
pub fn make_btb(name: &str, params: &Params) -> SimResult<Box<dyn BtbModel>> {
    match name {
        "generic" => Ok(Box::new(GenericBtb::new(
            params.bp.btb_entries,
            params.bp.btb_assoc,
        ))),
        _ => Err(FatalError::Config(format!(
            "unknown BTB '{name}' (expected generic)"
        ))),
    }
}

/// Instantiates an indirect-target predictor by registry name.
pub fn make_ibtb(name: &str, params: &Params) -> SimResult<Box<dyn IbtbModel>> {
    match name {
        "tc_tagless" => Ok(Box::new(TcTagless::new(params.bp.ibtb_entries))),
        _ => Err(FatalError::Config(format!(
            "unknown indirect-target predictor '{name}' (expected tc_tagless)"
        ))),
    }
}

/// Instantiates a confidence estimator by registry name.
pub fn make_conf(name: &str, params: &Params) -> SimResult<Box<dyn ConfEstimator>> {
    let mech = match name {
        "counter" => ConfMech::Counter,
        "majority" => ConfMech::MajorityVote,
        _ => {
            return Err(FatalError::Config(format!(
                "unknown confidence estimator '{name}' (expected counter|majority)"
            )));
        }
    };
    Ok(Box::new(ConfTable::new(
        mech,
        params.bp.bpc_bits,
        params.bp.bpc_ctr_bits,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_resolve() {
        let params = Params::default();
        assert!(make_dir_predictor("gshare", &params).is_ok());
        assert!(make_dir_predictor("static", &params).is_ok());
        assert!(make_btb("generic", &params).is_ok());
        assert!(make_ibtb("tc_tagless", &params).is_ok());
        assert!(make_conf("counter", &params).is_ok());
        assert!(make_conf("majority", &params).is_ok());
    }

    #[test]
    fn test_unknown_names_rejected() {
        let params = Params::default();
        assert!(make_dir_predictor("tage-scl", &params).is_err());
        assert!(make_btb("hashed", &params).is_err());
        assert!(make_ibtb("tagged", &params).is_err());
        assert!(make_conf("perceptron", &params).is_err());
    }
}
