// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Scalar expressions evaluated vectorized over chunks.
//!
//! The fragment runtime only needs the predicate/key surface: column
//! references, literals, comparisons, boolean connectives, null tests and
//! IN lists. Everything evaluates to an arrow array of `chunk.len()` rows.

pub mod agg;

use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
};
use arrow::compute::filter_record_batch;
use arrow::compute::kernels::boolean::{and_kleene, not, or_kleene};
use arrow::compute::kernels::cmp;
use arrow::compute::{cast, is_not_null, is_null};
use arrow::datatypes::DataType;
use hashbrown::HashSet;

use crate::common::ids::SlotId;
use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;

#[derive(Clone, Debug, PartialEq)]
pub enum LiteralValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Utf8(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug)]
pub enum Expr {
    ColumnRef(SlotId),
    Literal {
        value: LiteralValue,
        data_type: DataType,
    },
    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull {
        child: Box<Expr>,
        negated: bool,
    },
    InList {
        child: Box<Expr>,
        values: Vec<LiteralValue>,
        negated: bool,
    },
}

impl Expr {
    pub fn column(slot: SlotId) -> Self {
        Expr::ColumnRef(slot)
    }

    pub fn int_lit(v: i64, data_type: DataType) -> Self {
        Expr::Literal {
            value: LiteralValue::Int(v),
            data_type,
        }
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Self {
        Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eval(&self, chunk: &Chunk) -> Result<ArrayRef> {
        match self {
            Expr::ColumnRef(slot) => chunk.column_by_slot_id(*slot),
            Expr::Literal { value, data_type } => literal_array(value, data_type, chunk.len()),
            Expr::Cmp { op, left, right } => {
                let l = left.eval(chunk)?;
                let r = right.eval(chunk)?;
                let r = align_type(&l, r)?;
                let out = match op {
                    CmpOp::Eq => cmp::eq(&l, &r),
                    CmpOp::Ne => cmp::neq(&l, &r),
                    CmpOp::Lt => cmp::lt(&l, &r),
                    CmpOp::Le => cmp::lt_eq(&l, &r),
                    CmpOp::Gt => cmp::gt(&l, &r),
                    CmpOp::Ge => cmp::gt_eq(&l, &r),
                }?;
                Ok(Arc::new(out))
            }
            Expr::And(children) => {
                let mut acc: Option<BooleanArray> = None;
                for child in children {
                    let v = as_boolean(child.eval(chunk)?)?;
                    acc = Some(match acc {
                        None => v,
                        Some(prev) => and_kleene(&prev, &v)?,
                    });
                }
                match acc {
                    Some(v) => Ok(Arc::new(v)),
                    None => Ok(Arc::new(BooleanArray::from(vec![true; chunk.len()]))),
                }
            }
            Expr::Or(children) => {
                let mut acc: Option<BooleanArray> = None;
                for child in children {
                    let v = as_boolean(child.eval(chunk)?)?;
                    acc = Some(match acc {
                        None => v,
                        Some(prev) => or_kleene(&prev, &v)?,
                    });
                }
                match acc {
                    Some(v) => Ok(Arc::new(v)),
                    None => Ok(Arc::new(BooleanArray::from(vec![false; chunk.len()]))),
                }
            }
            Expr::Not(child) => {
                let v = as_boolean(child.eval(chunk)?)?;
                Ok(Arc::new(not(&v)?))
            }
            Expr::IsNull { child, negated } => {
                let v = child.eval(chunk)?;
                let out = if *negated { is_not_null(&v)? } else { is_null(&v)? };
                Ok(Arc::new(out))
            }
            Expr::InList {
                child,
                values,
                negated,
            } => {
                let v = child.eval(chunk)?;
                let mask = in_list_mask(&v, values)?;
                let out = if *negated { not(&mask)? } else { mask };
                Ok(Arc::new(out))
            }
        }
    }

    /// Evaluate as a selection predicate: nulls count as not-selected.
    pub fn eval_predicate(&self, chunk: &Chunk) -> Result<BooleanArray> {
        let v = as_boolean(self.eval(chunk)?)?;
        Ok(BooleanArray::from_iter(
            v.iter().map(|x| Some(x == Some(true))),
        ))
    }
}

/// Apply conjuncts to a chunk, keeping rows where every predicate is true.
pub fn filter_chunk(chunk: &Chunk, conjuncts: &[Expr]) -> Result<Chunk> {
    if conjuncts.is_empty() || chunk.is_empty() {
        return Ok(chunk.clone());
    }
    let mut mask: Option<BooleanArray> = None;
    for conjunct in conjuncts {
        let v = conjunct.eval_predicate(chunk)?;
        mask = Some(match mask {
            None => v,
            Some(prev) => and_kleene(&prev, &v)?,
        });
    }
    let mask = mask.expect("non-empty conjuncts");
    let filtered = filter_record_batch(&chunk.batch, &mask)?;
    Chunk::try_new(filtered)
}

fn as_boolean(array: ArrayRef) -> Result<BooleanArray> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| {
            Status::internal(format!(
                "predicate did not evaluate to boolean: {:?}",
                array.data_type()
            ))
        })
}

fn align_type(left: &ArrayRef, right: ArrayRef) -> Result<ArrayRef> {
    if left.data_type() == right.data_type() {
        return Ok(right);
    }
    cast(&right, left.data_type()).map_err(|e| {
        Status::invalid_argument(format!(
            "cannot compare {:?} with {:?}: {e}",
            left.data_type(),
            right.data_type()
        ))
    })
}

fn literal_array(value: &LiteralValue, data_type: &DataType, len: usize) -> Result<ArrayRef> {
    let base: ArrayRef = match value {
        LiteralValue::Null => return Ok(new_null_array(data_type, len)),
        LiteralValue::Bool(v) => Arc::new(BooleanArray::from(vec![*v; len])),
        LiteralValue::Int(v) => Arc::new(Int64Array::from(vec![*v; len])),
        LiteralValue::Float(v) => Arc::new(Float64Array::from(vec![*v; len])),
        LiteralValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); len])),
    };
    if base.data_type() == data_type {
        return Ok(base);
    }
    cast(&base, data_type)
        .map_err(|e| Status::invalid_argument(format!("literal cast to {data_type:?}: {e}")))
}

fn in_list_mask(array: &ArrayRef, values: &[LiteralValue]) -> Result<BooleanArray> {
    match array.data_type() {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            let casted = cast(array, &DataType::Int64)?;
            let arr = casted
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| Status::internal("in-list cast to Int64 failed"))?;
            let set: HashSet<i64> = values
                .iter()
                .filter_map(|v| match v {
                    LiteralValue::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Ok(BooleanArray::from_iter((0..arr.len()).map(|i| {
                if arr.is_null(i) {
                    Some(false)
                } else {
                    Some(set.contains(&arr.value(i)))
                }
            })))
        }
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Status::internal("in-list expects Utf8 array"))?;
            let set: HashSet<&str> = values
                .iter()
                .filter_map(|v| match v {
                    LiteralValue::Utf8(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            Ok(BooleanArray::from_iter((0..arr.len()).map(|i| {
                if arr.is_null(i) {
                    Some(false)
                } else {
                    Some(set.contains(arr.value(i)))
                }
            })))
        }
        other => Err(Status::unimplemented(format!(
            "in-list over {other:?} is not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::Field;
    use arrow::record_batch::RecordBatch;

    use crate::exec::chunk::field_with_slot_id;

    fn test_chunk() -> Chunk {
        let schema = Arc::new(arrow::datatypes::Schema::new(vec![field_with_slot_id(
            Field::new("a", DataType::Int32, true),
            SlotId::new(7),
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(vec![
                Some(1),
                Some(5),
                None,
                Some(9),
            ]))],
        )
        .expect("batch");
        Chunk::try_new(batch).expect("chunk")
    }

    #[test]
    fn comparison_with_literal_casts_to_column_type() {
        let chunk = test_chunk();
        let pred = Expr::cmp(
            CmpOp::Gt,
            Expr::column(SlotId::new(7)),
            Expr::int_lit(4, DataType::Int32),
        );
        let mask = pred.eval_predicate(&chunk).expect("eval");
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            vec![Some(false), Some(true), Some(false), Some(true)]
        );
    }

    #[test]
    fn filter_chunk_drops_null_predicate_rows() {
        let chunk = test_chunk();
        let pred = Expr::cmp(
            CmpOp::Ge,
            Expr::column(SlotId::new(7)),
            Expr::int_lit(1, DataType::Int32),
        );
        let out = filter_chunk(&chunk, &[pred]).expect("filter");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn in_list_treats_null_as_not_selected() {
        let chunk = test_chunk();
        let pred = Expr::InList {
            child: Box::new(Expr::column(SlotId::new(7))),
            values: vec![LiteralValue::Int(1), LiteralValue::Int(9)],
            negated: false,
        };
        let mask = pred.eval_predicate(&chunk).expect("eval");
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            vec![Some(true), Some(false), Some(false), Some(true)]
        );
    }
}
