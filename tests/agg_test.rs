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
//! Aggregate registry round-trips: update → finalize against references,
//! and the merge law `merge(serialize(s1), s2) == update(batch1 ++ batch2)`
//! for every registered pair.

mod common;

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, Float64Array, Int8Array, Int16Array, Int32Array, Int64Array,
    StringArray,
};
use arrow::compute::{cast, concat};
use arrow::datatypes::DataType;

use gneiss::exec::expr::agg::{
    AggStateArena, AggregateFuncResolver, AggregateFunctionRef,
};

fn arena() -> AggStateArena {
    AggStateArena::new(64 * 1024)
}

/// Run update over one state for all rows, returning the finalized scalar
/// array (length 1).
fn eval_update(func: &AggregateFunctionRef, arena: &mut AggStateArena, input: &[ArrayRef]) -> ArrayRef {
    let state = arena.alloc(func.state_size(), func.state_align());
    func.init_state(state);
    let rows = input.first().map(|a| a.len()).unwrap_or(0);
    let states = vec![state; rows];
    func.update_batch(&states, input).expect("update");
    let out = func.finalize_states(&[state]).expect("finalize");
    func.drop_state(state);
    out
}

/// Split-update then serialize-merge into a fresh state; the merge law
/// requires this to equal a single update over the concatenation.
fn eval_merge(
    func: &AggregateFunctionRef,
    arena: &mut AggStateArena,
    a: &[ArrayRef],
    b: &[ArrayRef],
) -> ArrayRef {
    let make_state = |arena: &mut AggStateArena| {
        let state = arena.alloc(func.state_size(), func.state_align());
        func.init_state(state);
        state
    };
    let s1 = make_state(arena);
    let s2 = make_state(arena);
    let s3 = make_state(arena);
    func.update_batch(&vec![s1; a[0].len()], a).expect("update a");
    func.update_batch(&vec![s2; b[0].len()], b).expect("update b");
    let ser1 = func.serialize_states(&[s1]).expect("serialize s1");
    let ser2 = func.serialize_states(&[s2]).expect("serialize s2");
    func.merge_batch(&[s3], &ser1).expect("merge s1");
    func.merge_batch(&[s3], &ser2).expect("merge s2");
    let out = func.finalize_states(&[s3]).expect("finalize");
    for s in [s1, s2, s3] {
        func.drop_state(s);
    }
    out
}

fn f64_value(array: &ArrayRef) -> Option<f64> {
    if array.is_null(0) {
        return None;
    }
    match array.data_type() {
        DataType::Float64 => Some(array.as_any().downcast_ref::<Float64Array>().unwrap().value(0)),
        DataType::Int64 => Some(array.as_any().downcast_ref::<Int64Array>().unwrap().value(0) as f64),
        DataType::Int32 => Some(array.as_any().downcast_ref::<Int32Array>().unwrap().value(0) as f64),
        DataType::Int16 => Some(array.as_any().downcast_ref::<Int16Array>().unwrap().value(0) as f64),
        DataType::Int8 => Some(array.as_any().downcast_ref::<Int8Array>().unwrap().value(0) as f64),
        _ => None,
    }
}

fn int32_input(values: Vec<Option<i32>>) -> Vec<ArrayRef> {
    vec![Arc::new(Int32Array::from(values)) as ArrayRef]
}

#[test]
fn numeric_functions_match_reference_values() {
    let resolver = AggregateFuncResolver::new();
    let mut arena = arena();
    let input = int32_input(vec![Some(1), Some(2), Some(2), Some(3), Some(5)]);

    let cases: Vec<(&str, f64)> = vec![
        ("count", 5.0),
        ("sum", 13.0),
        ("avg", 2.6),
        ("min", 1.0),
        ("max", 5.0),
        ("multi_distinct_count", 4.0),
        ("multi_distinct_sum", 11.0),
        // population variance of [1,2,2,3,5] around mean 2.6
        ("variance", 1.84),
        ("var_pop", 1.84),
        ("variance_samp", 2.3),
        ("stddev", 1.84f64.sqrt()),
        ("stddev_samp", 2.3f64.sqrt()),
        ("bitmap_union_int", 4.0),
        ("ndv", 4.0),
    ];
    for (name, expected) in cases {
        let (_, func) = resolver
            .lookup(name, &DataType::Int32, false)
            .unwrap_or_else(|| panic!("{name} over Int32 registered"));
        let out = eval_update(&func, &mut arena, &input);
        let got = f64_value(&out).unwrap_or_else(|| panic!("{name} finalized to null"));
        assert!(
            (got - expected).abs() < 1e-9,
            "{name}: expected {expected}, got {got}"
        );
    }
}

#[test]
fn nullable_variants_skip_nulls_and_finalize_empty_groups_to_null() {
    let resolver = AggregateFuncResolver::new();
    let mut arena = arena();

    let with_nulls = int32_input(vec![Some(4), None, Some(6), None]);
    let (_, sum) = resolver.lookup("sum", &DataType::Int32, true).expect("sum");
    let out = eval_update(&sum, &mut arena, &with_nulls);
    assert_eq!(f64_value(&out), Some(10.0));

    let all_null = int32_input(vec![None, None]);
    let out = eval_update(&sum, &mut arena, &all_null);
    assert!(out.is_null(0), "sum of nothing is NULL");

    // count is the exception: empty input counts zero, never NULL.
    let (_, count) = resolver.lookup("count", &DataType::Int32, true).expect("count");
    let out = eval_update(&count, &mut arena, &all_null);
    assert_eq!(f64_value(&out), Some(0.0));
}

#[test]
fn group_concat_and_string_minmax() {
    let resolver = AggregateFuncResolver::new();
    let mut arena = arena();
    let input: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec!["b", "a", "c"]))];

    let (_, gc) = resolver
        .lookup("group_concat", &DataType::Utf8, false)
        .expect("group_concat");
    let out = eval_update(&gc, &mut arena, &input);
    let arr = out.as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(arr.value(0), "b, a, c");

    let (_, min) = resolver.lookup("min", &DataType::Utf8, false).expect("min");
    let out = eval_update(&min, &mut arena, &input);
    assert_eq!(out.as_any().downcast_ref::<StringArray>().unwrap().value(0), "a");
}

#[test]
fn percentile_approx_interpolates() {
    let resolver = AggregateFuncResolver::new();
    let mut arena = arena();
    let values: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0, 4.0]));
    let percentiles: ArrayRef = Arc::new(Float64Array::from(vec![0.5; 4]));
    let (_, func) = resolver
        .lookup("percentile_approx", &DataType::Float64, false)
        .expect("percentile_approx");
    let out = eval_update(&func, &mut arena, &[values, percentiles]);
    assert_eq!(f64_value(&out), Some(2.5));
}

/// Build a Binary input column whose payloads are valid intermediates for
/// the named object function.
fn binary_payloads(resolver: &AggregateFuncResolver, name: &str, arena: &mut AggStateArena) -> ArrayRef {
    let source = if name.starts_with("hll") {
        let (_, ndv) = resolver.lookup("ndv", &DataType::Int32, false).expect("ndv");
        let state = arena.alloc(ndv.state_size(), ndv.state_align());
        ndv.init_state(state);
        let input = int32_input(vec![Some(1), Some(2), Some(3)]);
        ndv.update_batch(&vec![state; 3], &input).expect("update");
        let out = ndv.serialize_states(&[state, state]).expect("serialize");
        ndv.drop_state(state);
        out
    } else if name.starts_with("bitmap") || name == "intersect_count" {
        let (_, bm) = resolver
            .lookup("bitmap_union_int", &DataType::Int32, false)
            .expect("bitmap_union_int");
        let state = arena.alloc(bm.state_size(), bm.state_align());
        bm.init_state(state);
        let input = int32_input(vec![Some(1), Some(2), Some(9)]);
        bm.update_batch(&vec![state; 3], &input).expect("update");
        let out = bm.serialize_states(&[state, state]).expect("serialize");
        bm.drop_state(state);
        out
    } else {
        // percentile_union: intermediates of percentile_approx.
        let (_, pa) = resolver
            .lookup("percentile_approx", &DataType::Float64, false)
            .expect("percentile_approx");
        let state = arena.alloc(pa.state_size(), pa.state_align());
        pa.init_state(state);
        let values: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 5.0]));
        let ps: ArrayRef = Arc::new(Float64Array::from(vec![0.5, 0.5]));
        pa.update_batch(&vec![state; 2], &[values, ps]).expect("update");
        let out = pa.serialize_states(&[state, state]).expect("serialize");
        pa.drop_state(state);
        out
    };
    source
}

fn input_for(
    resolver: &AggregateFuncResolver,
    name: &str,
    arg_type: &DataType,
    arena: &mut AggStateArena,
    salt: i32,
) -> Vec<ArrayRef> {
    match arg_type {
        DataType::Utf8 => {
            let values: Vec<String> = (0..6).map(|i| format!("s{}", (i * 7 + salt) % 5)).collect();
            vec![Arc::new(StringArray::from(values)) as ArrayRef]
        }
        DataType::Binary => vec![binary_payloads(resolver, name, arena)],
        DataType::Float64 if name == "percentile_approx" => {
            let values: ArrayRef =
                Arc::new(Float64Array::from((0..6).map(|i| (i + salt) as f64).collect::<Vec<_>>()));
            let ps: ArrayRef = Arc::new(Float64Array::from(vec![0.5; 6]));
            vec![values, ps]
        }
        numeric => {
            let base: ArrayRef = Arc::new(Int32Array::from(
                (0..6).map(|i| ((i * 3 + salt) % 50)).collect::<Vec<_>>(),
            ));
            vec![cast(&base, numeric).expect("cast input")]
        }
    }
}

#[test]
fn merge_of_serialized_states_equals_single_update_for_every_pair() {
    let resolver = AggregateFuncResolver::new();
    let mut arena = arena();

    let entries: Vec<(String, DataType)> = resolver
        .entries()
        .filter(|(key, _)| !key.nullable)
        .map(|(key, _)| (key.name.clone(), key.arg_type.clone()))
        .collect();
    assert!(entries.len() > 40, "registry unexpectedly small");

    for (name, arg_type) in entries {
        let (_, func) = resolver
            .lookup(&name, &arg_type, false)
            .expect("entry resolvable");
        let a = input_for(&resolver, &name, &arg_type, &mut arena, 1);
        let b = input_for(&resolver, &name, &arg_type, &mut arena, 2);

        let combined: Vec<ArrayRef> = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| concat(&[x.as_ref(), y.as_ref()]).expect("concat"))
            .collect();
        let direct = eval_update(&func, &mut arena, &combined);
        let merged = eval_merge(&func, &mut arena, &a, &b);

        match (f64_value(&direct), f64_value(&merged)) {
            (Some(x), Some(y)) => assert!(
                (x - y).abs() < 1e-6,
                "{name} over {arg_type:?}: direct={x} merged={y}"
            ),
            _ => {
                // Non-numeric outputs compare bytewise.
                let dx = format!("{direct:?}");
                let dy = format!("{merged:?}");
                assert_eq!(dx, dy, "{name} over {arg_type:?}");
            }
        }
    }
}

#[test]
fn hll_union_folds_serialized_sketches() {
    let resolver = AggregateFuncResolver::new();
    let mut arena = arena();

    // Two ndv sketches over disjoint values, unioned through hll_union_agg.
    let (_, ndv) = resolver.lookup("ndv", &DataType::Int32, false).expect("ndv");
    let sketch = |arena: &mut AggStateArena, values: Vec<Option<i32>>| -> ArrayRef {
        let state = arena.alloc(ndv.state_size(), ndv.state_align());
        ndv.init_state(state);
        let n = values.len();
        ndv.update_batch(&vec![state; n], &int32_input(values)).expect("update");
        let out = ndv.serialize_states(&[state]).expect("serialize");
        ndv.drop_state(state);
        out
    };
    let s1 = sketch(&mut arena, (0..50).map(Some).collect());
    let s2 = sketch(&mut arena, (25..75).map(Some).collect());
    let payloads = concat(&[s1.as_ref(), s2.as_ref()]).expect("concat");
    assert!(payloads.as_any().downcast_ref::<BinaryArray>().is_some());

    let (_, union_agg) = resolver
        .lookup("hll_union_agg", &DataType::Binary, false)
        .expect("hll_union_agg");
    let out = eval_update(&union_agg, &mut arena, &[payloads]);
    // 75 distinct values, exact while the sketch is still explicit.
    assert_eq!(f64_value(&out), Some(75.0));
}
