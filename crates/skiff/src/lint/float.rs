//! Lint: Floating point columns.

use super::{AnnotationBuilder, LintContext};

pub fn lint_float(ctx: &mut LintContext<'_>) {
    let floats: Vec<_> = ctx
        .table
        .columns
        .iter()
        .filter(|c| c.is_float())
        .map(|c| (c.name.clone(), c.data_type.clone()))
        .collect();
    for (name, data_type) in floats {
        AnnotationBuilder::new("float", ctx.options.float)
            .msg(format!(
                "column {} of table {} is {}, which stores approximate values; use numeric for exact ones",
                name, ctx.table.name, data_type
            ))
            .emit(ctx);
    }
}
