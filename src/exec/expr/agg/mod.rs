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
//! Aggregate function registry.
//!
//! The resolver maps `(name, arg_type, return_type, nullable)` to a function
//! object. Every mapping is registered at construction; both a nullable and
//! a non-nullable variant exist for each `(arg_type, name)` pair, the
//! nullable one wrapping the base function with a null short-circuit.
//! Lookup misses return `None` and the caller fails the query.

pub mod function;
pub mod numeric;
pub mod object;

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::DataType;

pub use function::{
    alloc_states, AggStateArena, AggStatePtr, AggregateFunction, AggregateFunctionRef,
    NullableAggregateFunctionUnary,
};
use numeric::{
    is_float_type, AvgAgg, BitmapUnionIntAgg, CountAgg, CounterWindowAgg, GroupConcatAgg,
    MinMaxAgg, MinMaxStringAgg, MultiDistinctAgg, SumAgg, ValueWindowAgg, VarianceAgg,
};
use object::{BitmapAgg, BitmapMode, HllAgg, PercentileAgg};

pub(crate) use crate::exec::hash_table::key_set::bits_to_array as bits_array;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggFuncKey {
    pub name: String,
    pub arg_type: DataType,
    pub return_type: DataType,
    pub nullable: bool,
}

pub struct AggregateFuncResolver {
    mapping: HashMap<AggFuncKey, AggregateFunctionRef>,
}

const NUMERIC_ARG_TYPES: [DataType; 6] = [
    DataType::Int8,
    DataType::Int16,
    DataType::Int32,
    DataType::Int64,
    DataType::Float32,
    DataType::Float64,
];

const INT_ARG_TYPES: [DataType; 4] = [
    DataType::Int8,
    DataType::Int16,
    DataType::Int32,
    DataType::Int64,
];

impl AggregateFuncResolver {
    pub fn new() -> Self {
        let mut resolver = Self {
            mapping: HashMap::new(),
        };
        resolver.register_numeric_functions();
        resolver.register_string_functions();
        resolver.register_object_functions();
        resolver
    }

    /// Resolve one function instance; `None` on miss.
    pub fn get_aggregate_info(
        &self,
        name: &str,
        arg_type: &DataType,
        return_type: &DataType,
        nullable: bool,
    ) -> Option<AggregateFunctionRef> {
        self.mapping
            .get(&AggFuncKey {
                name: name.to_string(),
                arg_type: arg_type.clone(),
                return_type: return_type.clone(),
                nullable,
            })
            .cloned()
    }

    /// Resolve by name and argument type alone, returning the registered
    /// return type alongside the function.
    pub fn lookup(
        &self,
        name: &str,
        arg_type: &DataType,
        nullable: bool,
    ) -> Option<(DataType, AggregateFunctionRef)> {
        self.mapping
            .iter()
            .find(|(key, _)| {
                key.name == name && key.arg_type == *arg_type && key.nullable == nullable
            })
            .map(|(key, func)| (key.return_type.clone(), Arc::clone(func)))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&AggFuncKey, &AggregateFunctionRef)> {
        self.mapping.iter()
    }

    fn add_pair(
        &mut self,
        name: &str,
        arg_type: DataType,
        return_type: DataType,
        non_nullable: AggregateFunctionRef,
        nullable: AggregateFunctionRef,
    ) {
        self.mapping.insert(
            AggFuncKey {
                name: name.to_string(),
                arg_type: arg_type.clone(),
                return_type: return_type.clone(),
                nullable: false,
            },
            non_nullable,
        );
        self.mapping.insert(
            AggFuncKey {
                name: name.to_string(),
                arg_type,
                return_type,
                nullable: true,
            },
            nullable,
        );
    }

    /// Register both variants of a unary aggregate; the nullable one wraps
    /// the base function.
    fn add_unary<F>(&mut self, name: &str, arg_type: DataType, return_type: DataType, make: F)
    where
        F: Fn() -> AggregateFunctionRef,
    {
        let base = make();
        let wrapped: AggregateFunctionRef = Arc::new(NullableAggregateFunctionUnary::new(make()));
        self.add_pair(name, arg_type, return_type, base, wrapped);
    }

    fn register_numeric_functions(&mut self) {
        for arg in NUMERIC_ARG_TYPES {
            let sum_type = if is_float_type(&arg) {
                DataType::Float64
            } else {
                DataType::Int64
            };

            // count's nullable rendition skips nulls itself: an empty group
            // still counts 0, never NULL.
            self.add_pair(
                "count",
                arg.clone(),
                DataType::Int64,
                Arc::new(CountAgg::new(false)),
                Arc::new(CountAgg::new(true)),
            );

            {
                let arg = arg.clone();
                self.add_unary("sum", arg.clone(), sum_type.clone(), move || {
                    Arc::new(SumAgg::new(&arg))
                });
            }
            self.add_unary("avg", arg.clone(), DataType::Float64, || Arc::new(AvgAgg));
            {
                let arg = arg.clone();
                self.add_unary("min", arg.clone(), arg.clone(), move || {
                    Arc::new(MinMaxAgg::new(arg.clone(), true))
                });
            }
            {
                let arg = arg.clone();
                self.add_unary("max", arg.clone(), arg.clone(), move || {
                    Arc::new(MinMaxAgg::new(arg.clone(), false))
                });
            }
            {
                let arg = arg.clone();
                self.add_unary(
                    "multi_distinct_count",
                    arg.clone(),
                    DataType::Int64,
                    move || Arc::new(MultiDistinctAgg::new("multi_distinct_count", true, &arg)),
                );
            }
            {
                let arg = arg.clone();
                self.add_unary(
                    "multi_distinct_sum",
                    arg.clone(),
                    sum_type.clone(),
                    move || Arc::new(MultiDistinctAgg::new("multi_distinct_sum", false, &arg)),
                );
            }

            for name in ["variance", "variance_pop", "var_pop"] {
                self.add_unary(name, arg.clone(), DataType::Float64, move || {
                    Arc::new(VarianceAgg::new(name, false, false))
                });
            }
            for name in ["variance_samp", "var_samp"] {
                self.add_unary(name, arg.clone(), DataType::Float64, move || {
                    Arc::new(VarianceAgg::new(name, true, false))
                });
            }
            for name in ["stddev", "stddev_pop", "std"] {
                self.add_unary(name, arg.clone(), DataType::Float64, move || {
                    Arc::new(VarianceAgg::new(name, false, true))
                });
            }
            self.add_unary("stddev_samp", arg.clone(), DataType::Float64, || {
                Arc::new(VarianceAgg::new("stddev_samp", true, true))
            });

            for name in ["ndv", "approx_count_distinct"] {
                let arg_inner = arg.clone();
                self.add_unary(name, arg.clone(), DataType::Int64, move || {
                    Arc::new(HllAgg::ndv(name, arg_inner.clone()))
                });
            }

            for name in ["row_number", "rank", "dense_rank"] {
                self.add_unary(name, arg.clone(), DataType::Int64, move || {
                    Arc::new(CounterWindowAgg::new(name))
                });
            }
            for (name, keep_first) in [
                ("first_value", true),
                ("last_value", false),
                ("lead", false),
                ("lag", false),
            ] {
                let arg_inner = arg.clone();
                self.add_unary(name, arg.clone(), arg.clone(), move || {
                    Arc::new(ValueWindowAgg::new(name, arg_inner.clone(), keep_first))
                });
            }
        }

        for arg in INT_ARG_TYPES {
            self.add_unary("bitmap_union_int", arg, DataType::Int64, || {
                Arc::new(BitmapUnionIntAgg)
            });
        }
    }

    fn register_string_functions(&mut self) {
        self.add_pair(
            "count",
            DataType::Utf8,
            DataType::Int64,
            Arc::new(CountAgg::new(false)),
            Arc::new(CountAgg::new(true)),
        );
        self.add_unary("min", DataType::Utf8, DataType::Utf8, || {
            Arc::new(MinMaxStringAgg::new(true))
        });
        self.add_unary("max", DataType::Utf8, DataType::Utf8, || {
            Arc::new(MinMaxStringAgg::new(false))
        });
        self.add_unary("group_concat", DataType::Utf8, DataType::Utf8, || {
            Arc::new(GroupConcatAgg)
        });
        for name in ["ndv", "approx_count_distinct"] {
            self.add_unary(name, DataType::Utf8, DataType::Int64, move || {
                Arc::new(HllAgg::ndv(name, DataType::Utf8))
            });
        }
    }

    fn register_object_functions(&mut self) {
        for name in ["hll_union", "hll_raw_agg"] {
            self.add_unary(name, DataType::Binary, DataType::Binary, move || {
                Arc::new(HllAgg::union(name))
            });
        }
        self.add_unary("hll_union_agg", DataType::Binary, DataType::Int64, || {
            Arc::new(HllAgg::union_count("hll_union_agg"))
        });
        self.add_unary("bitmap_union", DataType::Binary, DataType::Binary, || {
            Arc::new(BitmapAgg::new("bitmap_union", BitmapMode::Union))
        });
        self.add_unary(
            "bitmap_union_count",
            DataType::Binary,
            DataType::Int64,
            || Arc::new(BitmapAgg::new("bitmap_union_count", BitmapMode::UnionCount)),
        );
        self.add_unary("bitmap_intersect", DataType::Binary, DataType::Binary, || {
            Arc::new(BitmapAgg::new("bitmap_intersect", BitmapMode::Intersect))
        });
        self.add_unary("intersect_count", DataType::Binary, DataType::Int64, || {
            Arc::new(BitmapAgg::new("intersect_count", BitmapMode::IntersectCount))
        });
        self.add_unary(
            "percentile_approx",
            DataType::Float64,
            DataType::Float64,
            || Arc::new(PercentileAgg::approx()),
        );
        self.add_unary(
            "percentile_union",
            DataType::Binary,
            DataType::Binary,
            || Arc::new(PercentileAgg::union()),
        );
    }
}

impl Default for AggregateFuncResolver {
    fn default() -> Self {
        Self::new()
    }
}
