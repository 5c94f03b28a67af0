//! The dynamic op record and its backing pool.

/// Op record, static instruction info, and pipeline-state enums.
pub mod op;
/// Bounded-growth arena for op records.
pub mod op_pool;

pub use op::{
    BarKind, CfType, DepType, InstInfo, MemType, NUM_DEP_TYPES, Op, OpId, OpState, OpType,
    OracleInfo, PredInfo, RecoveryInfo, TableInfo, WakeUpEntry, fu_type_mask, full_fu_type_mask,
};
pub use op_pool::OpPool;
