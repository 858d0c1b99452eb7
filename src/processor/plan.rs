//! Per-load column plan: which columns the input supplies, which are
//! generated, and where generated values land in the output row.

use crate::config::{LoadConfig, Partitioning};
use crate::error::{LoadError, Result};
use crate::generated::{
    DefaultEvaluator, GeneratedValueProvider, Generators, ReducedDefault, reduce_default,
};
use crate::row::ColumnDescriptor;
use chrono::{DateTime, Local};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub(crate) enum ValueSource {
    Serial(Arc<dyn GeneratedValueProvider>),
    RowId(Arc<dyn GeneratedValueProvider>),
    Constant(Option<String>),
    Evaluated {
        expression: String,
        evaluator: Arc<dyn DefaultEvaluator>,
    },
}

#[derive(Clone)]
pub(crate) struct Injection {
    /// Index in the output row once every earlier injection is in place.
    pub(crate) output_index: usize,
    pub(crate) column: String,
    pub(crate) source: ValueSource,
}

impl Injection {
    pub(crate) fn next_value(&self) -> Result<Option<String>> {
        match &self.source {
            ValueSource::Serial(p) | ValueSource::RowId(p) => p.next_value().map(Some),
            ValueSource::Constant(v) => Ok(v.clone()),
            ValueSource::Evaluated {
                expression,
                evaluator,
            } => evaluator.evaluate(&self.column, expression),
        }
    }
}

/// Column bookkeeping shared read-only by all processors of a load.
#[derive(Clone)]
pub struct ColumnPlan {
    pub(crate) injections: Vec<Injection>,
    pub(crate) serial_input: Option<usize>,
    pub(crate) row_id_input: Option<usize>,
    /// Supplied non-nullable columns without a default: (input index, name).
    pub(crate) not_null_inputs: Vec<(usize, String)>,
    pub(crate) force_not_null: Vec<bool>,
    pub(crate) supplied_count: usize,
    pub(crate) node_column: bool,
    output_columns: Vec<String>,
}

impl ColumnPlan {
    /// Work out the plan for `config`.
    ///
    /// Unsupplied serial and row-id columns take their provider when one is
    /// attached, otherwise their default like any other column. Columns with
    /// neither a provider nor a default are left to the database when
    /// nullable.
    ///
    /// # Errors
    /// A layout without supplied columns, a non-nullable column with no way
    /// to produce a value, or a non-constant default with no evaluator.
    pub fn build(
        config: &LoadConfig,
        generators: &Generators,
        load_start: DateTime<Local>,
    ) -> Result<Self> {
        let layout = &config.layout;
        let supplied = layout.supplied_positions()?;
        if supplied.is_empty() {
            return Err(LoadError::config(format!(
                "no input columns supplied for {}",
                layout.table
            )));
        }

        let mut injections = Vec::new();
        let mut output_columns = Vec::with_capacity(layout.columns.len());
        for (pos, column) in layout.columns.iter().enumerate() {
            if supplied.contains(&pos) {
                output_columns.push(column.name.clone());
                continue;
            }
            let source = match (&generators.serial, &generators.row_id) {
                (Some(p), _) if column.is_serial => Some(ValueSource::Serial(Arc::clone(p))),
                (_, Some(p)) if column.is_row_id => Some(ValueSource::RowId(Arc::clone(p))),
                _ => match &column.default_expression {
                    Some(expr) => Some(match reduce_default(expr, load_start) {
                        ReducedDefault::Constant(v) => ValueSource::Constant(v),
                        ReducedDefault::PerRow(expression) => {
                            let evaluator = generators.evaluator.clone().ok_or_else(|| {
                                LoadError::config(format!(
                                    "default of column '{}' needs a default evaluator",
                                    column.name
                                ))
                            })?;
                            ValueSource::Evaluated {
                                expression,
                                evaluator,
                            }
                        }
                    }),
                    None if !column.is_nullable => {
                        return Err(LoadError::config(format!(
                            "column '{}' is not supplied and has no default",
                            column.name
                        )));
                    }
                    None => None,
                },
            };
            if let Some(source) = source {
                debug!(column = %column.name, position = pos, "generated column");
                injections.push(Injection {
                    output_index: output_columns.len(),
                    column: column.name.clone(),
                    source,
                });
                output_columns.push(column.name.clone());
            }
        }

        let input_of = |pred: fn(&ColumnDescriptor) -> bool| {
            supplied.iter().position(|&p| pred(&layout.columns[p]))
        };
        let force_names = config
            .format
            .csv
            .as_ref()
            .map(|c| c.force_not_null.as_slice())
            .unwrap_or_default();
        let force_not_null = supplied
            .iter()
            .map(|&p| {
                force_names
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(&layout.columns[p].name))
            })
            .collect();
        let not_null_inputs = supplied
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                let c = &layout.columns[**p];
                !c.is_nullable && c.default_expression.is_none()
            })
            .map(|(i, p)| (i, layout.columns[*p].name.clone()))
            .collect();

        Ok(Self {
            injections,
            serial_input: input_of(|c| c.is_serial),
            row_id_input: input_of(|c| c.is_row_id),
            not_null_inputs,
            force_not_null,
            supplied_count: supplied.len(),
            node_column: config.partitioning == Partitioning::ExplicitNode,
            output_columns,
        })
    }

    /// Columns each input row must carry, including a trailing node id.
    #[must_use]
    pub fn expected_inputs(&self) -> usize {
        self.supplied_count + usize::from(self.node_column)
    }

    /// Destination columns of output rows, in table order.
    #[must_use]
    pub fn output_columns(&self) -> &[String] {
        &self.output_columns
    }

    /// Number of generated columns spliced into each row.
    #[must_use]
    pub fn generated_count(&self) -> usize {
        self.injections.len()
    }
}
