use serde_json::Value as Json;

use crate::core::error::{Error, ErrorKind, Result};
use crate::expr::ast::Expr;
use crate::ops::group::{AccSpec, parse_group_spec};
use crate::ops::project::{Projection, compile_add_fields};
use crate::ops::sort::SortSpec;
use crate::ops::unwind::parse_unwind_spec;
use crate::query::predicate::Predicate;

/// Classified pipeline stage. The finite set the incremental engine
/// executes; anything else falls back to the external one-shot engine.
#[derive(Debug)]
pub enum Stage {
    Match(Predicate),
    Project(Projection),
    AddFields(Vec<(String, Expr)>),
    Unwind { path: String, preserve_null_and_empty: bool },
    Group { key: Expr, accumulators: Vec<(String, AccSpec)> },
    Sort(SortSpec),
    Limit(usize),
    Skip(usize),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unwind { .. } => "$unwind",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
        }
    }
}

/// Why a pipeline could not be classified for the incremental path.
#[derive(Debug)]
pub struct ClassifyError {
    pub stage_index: usize,
    pub stage_name: String,
    pub error: Error,
}

impl ClassifyError {
    fn new(stage_index: usize, stage_name: &str, error: Error) -> Self {
        ClassifyError { stage_index, stage_name: stage_name.to_string(), error }
    }

    pub fn is_unsupported(&self) -> bool {
        self.error.kind == ErrorKind::Unsupported
    }

    pub fn into_error(self) -> Error {
        Error::at_stage(self.error.kind, self.stage_index, &self.error.context)
    }
}

/// Classify a pipeline of stage descriptors. Each descriptor is a
/// single-key mapping from stage name to stage body. An unknown stage
/// name or operator yields an `Unsupported` classification error; a
/// malformed body yields a `Parse` one. The incremental path is all or
/// nothing, so the first failure wins.
pub fn classify(pipeline: &[Json]) -> std::result::Result<Vec<Stage>, ClassifyError> {
    let mut stages = Vec::with_capacity(pipeline.len());
    for (index, descriptor) in pipeline.iter().enumerate() {
        let map = match descriptor.as_object() {
            Some(map) if map.len() == 1 => map,
            _ => {
                return Err(ClassifyError::new(
                    index,
                    "?",
                    Error::new(
                        ErrorKind::Parse,
                        "stage descriptor must be a single-key object".to_string(),
                    ),
                ));
            }
        };
        let (name, body) = map.iter().next().unwrap();
        let parsed = classify_one(name, body)
            .map_err(|error| ClassifyError::new(index, name, error))?;
        stages.push(parsed);
    }
    Ok(stages)
}

fn classify_one(name: &str, body: &Json) -> Result<Stage> {
    match name {
        "$match" => Ok(Stage::Match(Predicate::compile(body)?)),
        "$project" => Ok(Stage::Project(Projection::compile(body)?)),
        "$addFields" | "$set" => Ok(Stage::AddFields(compile_add_fields(body)?)),
        "$unwind" => {
            let (path, preserve_null_and_empty) = parse_unwind_spec(body)?;
            Ok(Stage::Unwind { path, preserve_null_and_empty })
        }
        "$group" => {
            let (key, accumulators) = parse_group_spec(body)?;
            Ok(Stage::Group { key, accumulators })
        }
        "$sort" => Ok(Stage::Sort(SortSpec::compile(body)?)),
        "$limit" => parse_count(body, "$limit").map(Stage::Limit),
        "$skip" => parse_count(body, "$skip").map(Stage::Skip),
        other => Err(Error::new(
            ErrorKind::Unsupported,
            format!("stage '{}' is outside the incremental set", other),
        )),
    }
}

fn parse_count(body: &Json, name: &str) -> Result<usize> {
    body.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| {
            Error::new(ErrorKind::Parse, format!("{} requires a nonnegative integer", name))
        })
}

/// Contract for the externally supplied standard engine the collection
/// delegates to when a pipeline cannot run incrementally.
pub trait StandardEngine: Send + Sync {
    fn evaluate(
        &self,
        pipeline: &[Json],
        documents: &[crate::core::value::Document],
    ) -> Result<Vec<crate::core::value::Document>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(json: &str) -> std::result::Result<Vec<Stage>, ClassifyError> {
        let pipeline: Vec<Json> = serde_json::from_str(json).unwrap();
        classify(&pipeline)
    }

    #[test]
    fn test_full_supported_pipeline() {
        let out = stages(
            r#"[
                {"$match": {"v": {"$gt": 1}}},
                {"$addFields": {"w": {"$multiply": ["$v", 2]}}},
                {"$unwind": "$tags"},
                {"$group": {"_id": "$tags", "n": {"$sum": 1}}},
                {"$sort": {"n": -1}},
                {"$limit": 3},
                {"$skip": 1}
            ]"#,
        )
        .unwrap();
        assert_eq!(out.len(), 7);
        assert_eq!(out[0].name(), "$match");
        assert_eq!(out[3].name(), "$group");
    }

    #[test]
    fn test_set_is_add_fields() {
        let out = stages(r#"[{"$set": {"x": 1}}]"#).unwrap();
        assert_eq!(out[0].name(), "$addFields");
    }

    #[test]
    fn test_unknown_stage_is_unsupported_with_index() {
        let err = stages(r#"[{"$match": {}}, {"$lookup": {"from": "other"}}]"#).unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(err.stage_index, 1);
        assert_eq!(err.stage_name, "$lookup");
    }

    #[test]
    fn test_parse_error_is_not_fallback() {
        let err = stages(r#"[{"$limit": "three"}]"#).unwrap_err();
        assert!(!err.is_unsupported());
        assert_eq!(err.stage_index, 0);
        let surfaced = err.into_error();
        assert!(surfaced.context.contains("stage 0"));
    }

    #[test]
    fn test_multi_key_descriptor_rejected() {
        let err = stages(r#"[{"$match": {}, "$limit": 1}]"#).unwrap_err();
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_unsupported_expression_operator_bubbles_up() {
        let err = stages(r#"[{"$addFields": {"x": {"$function": {}}}}]"#).unwrap_err();
        assert!(err.is_unsupported());
    }
}
