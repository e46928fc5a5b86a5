//! Lint: Table without a primary key.

use super::{AnnotationBuilder, LintContext};

pub fn lint_pk(ctx: &mut LintContext<'_>) {
    if ctx.table.primary_key.is_none() {
        AnnotationBuilder::new("pk", ctx.options.pk)
            .msg(format!("table {} does not have a primary key", ctx.table.name))
            .emit(ctx);
    }
}
