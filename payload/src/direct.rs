//! Direct mode: run the input DDL as-is, no shadow machinery.

use common::err::OResult;
use connection::DbSession;
use schema::parser::split_statements;
use tracing::info;

use crate::hooks::{HookPoint, Hooks};

pub async fn run_direct(session: &mut DbSession, input: &str, hooks: &Hooks) -> OResult<usize> {
    let statements = split_statements(input)?;
    for stmt in &statements {
        session.exec(stmt).await?;
        hooks.fire(HookPoint::AfterRunDdl).await?;
    }
    info!("direct mode ran {} statement(s)", statements.len());
    Ok(statements.len())
}
