use anyhow::{Context, Result};

use tenantry::query::{compile as compile_matrix, CountOptions, FilterMatrix, QueryOptions};

use crate::utils;

/// Decode a wire query string and show what the repository will see
pub fn parse(query: &str, count: bool) -> Result<()> {
    if count {
        let options = CountOptions::from_query_string(query)?;
        utils::section("Count options");
        println!("{}", utils::to_pretty_json(&options)?);
        return Ok(());
    }

    let options = QueryOptions::from_query_string(query)?;
    utils::section("Query options");
    println!("{}", utils::to_pretty_json(&options)?);

    utils::section("Pagination");
    match options.pagination() {
        Some(window) => utils::info(&format!(
            "page {} -> offset {}, limit {}",
            options.page_number(),
            window.offset,
            window.limit
        )),
        None => utils::info("unpaginated (no limit)"),
    }
    if options.page.is_some_and(|page| page < 1) {
        utils::warning("page below 1 is treated as page 1");
    }

    utils::section("Canonical query string");
    println!("{}", options.to_query_string()?);
    Ok(())
}

/// Decode a `where` matrix and print the compiled predicate
pub fn compile(filter: &str) -> Result<()> {
    let predicate = compile_filter(filter)?;
    if predicate.is_all() {
        utils::warning("empty filter matches every row");
    }
    println!("{}", utils::to_pretty_json(&predicate)?);
    utils::success("filter compiled");
    Ok(())
}

fn compile_filter(filter: &str) -> Result<tenantry::query::Predicate> {
    let matrix: FilterMatrix =
        serde_json::from_str(filter).context("WHERE must be a JSON array of filter groups")?;
    for condition in matrix.iter().flatten() {
        condition.validate()?;
    }
    Ok(compile_matrix(&matrix)?)
}
