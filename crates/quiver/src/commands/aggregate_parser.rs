//! FT.AGGREGATE argument parsing: the search front end, the LOAD clause,
//! and the ordered stage list. Attribute slots are assigned here so stage
//! execution never looks field names up per record.

use fletch::aggregate::{AttributeMap, Reducer, ReducerKind, SortKey, Stage};
use fletch::expr::Expr;
use fletch::{IndexSchema, Result, UserError};

use crate::commands::args::ArgsIterator;
use crate::commands::search_parser::SearchCommand;

fn syntax(message: impl Into<String>) -> fletch::Error {
    UserError::InvalidQuerySyntax(message.into()).into()
}

pub struct AggregateCommand {
    pub search: SearchCommand,
    pub load_all: bool,
    pub load_key: bool,
    /// Loaded schema aliases, in slot order with the rest of `attributes`.
    pub loads: Vec<String>,
    pub stages: Vec<Stage>,
    pub attributes: AttributeMap,
}

pub const KEY_ATTRIBUTE: &str = "__key";

impl AggregateCommand {
    pub fn parse(schema: &IndexSchema, args: &[Vec<u8>]) -> Result<AggregateCommand> {
        // the front end (query string + PARAMS/DIALECT/TIMEOUT...) is the
        // search surface; stage keywords are carved out below
        let stage_start = find_first_stage_keyword(args);
        let mut search = SearchCommand::parse(schema, &args[..stage_start])?;
        if search.parameters.no_content {
            return Err(syntax("NOCONTENT is not supported by FT.AGGREGATE"));
        }
        // sorting and grouping happen here, after the merge
        search.parameters.force_complete_results = true;
        search.parameters.sortby = None;

        let mut command = AggregateCommand {
            search,
            load_all: false,
            load_key: false,
            loads: Vec::new(),
            stages: Vec::new(),
            attributes: AttributeMap::default(),
        };

        let mut itr = ArgsIterator::new(&args[stage_start..]);
        while !itr.done() {
            if itr.match_keyword("LOAD") {
                command.parse_load(schema, &mut itr)?;
            } else if itr.match_keyword("APPLY") {
                command.parse_apply(&mut itr)?;
            } else if itr.match_keyword("FILTER") {
                command.parse_filter_stage(&mut itr)?;
            } else if itr.match_keyword("SORTBY") {
                command.parse_sortby(&mut itr)?;
            } else if itr.match_keyword("GROUPBY") {
                command.parse_groupby(&mut itr)?;
            } else if itr.match_keyword("LIMIT") {
                let offset = itr.next_usize("LIMIT offset")?;
                let count = itr.next_usize("LIMIT count")?;
                command.stages.push(Stage::Limit { offset, count });
            } else {
                return Err(syntax(format!(
                    "Unexpected aggregate stage at position {}: {}",
                    itr.position() + 1,
                    itr.peek_str().unwrap_or("<binary>")
                )));
            }
        }
        Ok(command)
    }

    fn parse_load(&mut self, schema: &IndexSchema, itr: &mut ArgsIterator) -> Result<()> {
        if itr.match_keyword("*") {
            self.load_all = true;
            for attribute in schema.attributes() {
                self.register_load(schema, &attribute.alias.clone())?;
            }
            return Ok(());
        }
        let count = itr.next_usize("LOAD count")?;
        for _ in 0..count {
            let field = itr.next_str()?.to_string();
            let field = field.strip_prefix('@').unwrap_or(&field).to_string();
            if field == KEY_ATTRIBUTE {
                self.load_key = true;
                self.attributes.slot_or_create(KEY_ATTRIBUTE);
                continue;
            }
            self.register_load(schema, &field)?;
        }
        Ok(())
    }

    fn register_load(&mut self, schema: &IndexSchema, alias: &str) -> Result<()> {
        let identifier = schema
            .identifier(alias)
            .ok_or_else(|| UserError::UnknownAttribute(alias.to_string()))?;
        self.attributes.slot_or_create(alias);
        self.loads.push(alias.to_string());
        self.search.parameters.return_attributes.push(fletch::ReturnAttribute {
            identifier,
            attribute_alias: Some(alias.to_string()),
            alias: alias.to_string(),
        });
        Ok(())
    }

    fn parse_apply(&mut self, itr: &mut ArgsIterator) -> Result<()> {
        let expression = itr.next_str()?;
        let expr = Expr::compile(&mut self.attributes.lookup(), expression)?;
        itr.expect_keyword("AS")?;
        let name = itr.next_str()?.to_string();
        let slot = self.attributes.slot_or_create(&name);
        self.stages.push(Stage::Apply { name, slot, expr });
        Ok(())
    }

    fn parse_filter_stage(&mut self, itr: &mut ArgsIterator) -> Result<()> {
        let expression = itr.next_str()?;
        let expr = Expr::compile(&mut self.attributes.lookup(), expression)?;
        self.stages.push(Stage::Filter { expr });
        Ok(())
    }

    fn parse_sortby(&mut self, itr: &mut ArgsIterator) -> Result<()> {
        let nargs = itr.next_usize("SORTBY nargs")?;
        let mut keys = Vec::new();
        let mut consumed = 0;
        while consumed < nargs {
            let field = itr.next_str()?;
            consumed += 1;
            let field = field
                .strip_prefix('@')
                .ok_or_else(|| syntax("SORTBY properties must start with `@`"))?;
            let expr = Expr::compile(&mut self.attributes.lookup(), &format!("@{field}"))?;
            let mut ascending = true;
            if consumed < nargs {
                if itr.match_keyword("ASC") {
                    consumed += 1;
                } else if itr.match_keyword("DESC") {
                    ascending = false;
                    consumed += 1;
                }
            }
            keys.push(SortKey { expr, ascending });
        }
        if keys.is_empty() {
            return Err(syntax("SORTBY requires at least one property"));
        }
        let max = if itr.match_keyword("MAX") {
            Some(itr.next_usize("SORTBY MAX")?)
        } else {
            None
        };
        self.stages.push(Stage::SortBy { keys, max });
        Ok(())
    }

    fn parse_groupby(&mut self, itr: &mut ArgsIterator) -> Result<()> {
        let nargs = itr.next_usize("GROUPBY nargs")?;
        let mut group_slots = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            let field = itr.next_str()?;
            let field = field
                .strip_prefix('@')
                .ok_or_else(|| syntax("GROUPBY properties must start with `@`"))?;
            let slot = self
                .attributes
                .slot_of(field)
                .ok_or_else(|| UserError::UnknownAttribute(field.to_string()))?;
            group_slots.push(slot);
        }
        let mut reducers = Vec::new();
        while itr.match_keyword("REDUCE") {
            let function = itr.next_str()?;
            let (kind, min_nargs, max_nargs) = ReducerKind::from_name(function)
                .ok_or_else(|| UserError::UnknownFunction(function.to_string()))?;
            let reducer_nargs = itr.next_usize("REDUCE nargs")?;
            if reducer_nargs < min_nargs || reducer_nargs > max_nargs {
                return Err(UserError::BadFunctionArity {
                    name: function.to_string(),
                    min: min_nargs,
                    max: max_nargs,
                    got: reducer_nargs,
                }
                .into());
            }
            let mut args = Vec::with_capacity(reducer_nargs);
            for _ in 0..reducer_nargs {
                let raw = itr.next_str()?;
                args.push(Expr::compile(&mut self.attributes.lookup(), raw)?);
            }
            let output_name = if itr.match_keyword("AS") {
                itr.next_str()?.to_string()
            } else {
                function.to_ascii_lowercase()
            };
            let output_slot = self.attributes.slot_or_create(&output_name);
            reducers.push(Reducer { kind, args, output_slot, output_name });
        }
        self.stages.push(Stage::GroupBy { group_slots, reducers });
        Ok(())
    }
}

/// Position of the first stage keyword, i.e. where the shared search front
/// end stops. LIMIT belongs to the stage list in aggregates.
fn find_first_stage_keyword(args: &[Vec<u8>]) -> usize {
    const STAGES: [&str; 6] = ["LOAD", "APPLY", "FILTER", "SORTBY", "GROUPBY", "LIMIT"];
    for (position, arg) in args.iter().enumerate() {
        // the query string itself is the first argument, never a keyword
        if position == 0 {
            continue;
        }
        if let Ok(arg) = std::str::from_utf8(arg) {
            if STAGES.iter().any(|s| arg.eq_ignore_ascii_case(s)) {
                return position;
            }
        }
    }
    args.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::args::argv;

    fn schema() -> IndexSchema {
        IndexSchema::builder("idx")
            .numeric("x", "x")
            .unwrap()
            .tag("group", "group", ',', false)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn stage_ordering_is_preserved() {
        let schema = schema();
        let args = argv(&[
            "*", "LOAD", "2", "@x", "@group", "APPLY", "@x * 2", "AS", "doubled", "FILTER",
            "@doubled > 4", "SORTBY", "2", "@doubled", "DESC", "MAX", "3", "LIMIT", "0", "2",
        ]);
        let command = AggregateCommand::parse(&schema, &args).unwrap();
        assert_eq!(command.stages.len(), 4);
        assert!(matches!(command.stages[0], Stage::Apply { .. }));
        assert!(matches!(command.stages[1], Stage::Filter { .. }));
        assert!(matches!(command.stages[2], Stage::SortBy { max: Some(3), .. }));
        assert!(matches!(command.stages[3], Stage::Limit { offset: 0, count: 2 }));
        assert_eq!(command.loads, vec!["x", "group"]);
        assert!(command.search.parameters.requires_complete_results());
    }

    #[test]
    fn groupby_with_reducers() {
        let schema = schema();
        let args = argv(&[
            "*", "LOAD", "1", "@group", "GROUPBY", "1", "@group", "REDUCE", "COUNT", "0", "AS",
            "n", "REDUCE", "SUM", "1", "@group", "AS", "total",
        ]);
        let command = AggregateCommand::parse(&schema, &args).unwrap();
        let Stage::GroupBy { group_slots, reducers } = &command.stages[0] else {
            panic!("expected GROUPBY");
        };
        assert_eq!(group_slots.len(), 1);
        assert_eq!(reducers.len(), 2);
        assert_eq!(reducers[0].kind, ReducerKind::Count);
        assert_eq!(reducers[1].output_name, "total");
    }

    #[test]
    fn load_star_and_key() {
        let schema = schema();
        let args = argv(&["*", "LOAD", "*"]);
        let command = AggregateCommand::parse(&schema, &args).unwrap();
        assert!(command.load_all);
        assert_eq!(command.loads, vec!["x", "group"]);

        let args = argv(&["*", "LOAD", "1", "__key"]);
        let command = AggregateCommand::parse(&schema, &args).unwrap();
        assert!(command.load_key);
    }

    #[test]
    fn unknown_pieces_error() {
        let schema = schema();
        assert!(AggregateCommand::parse(&schema, &argv(&["*", "LOAD", "1", "@nope"])).is_err());
        assert!(AggregateCommand::parse(
            &schema,
            &argv(&["*", "LOAD", "1", "@x", "GROUPBY", "1", "@missing"])
        )
        .is_err());
        assert!(AggregateCommand::parse(
            &schema,
            &argv(&["*", "GROUPBY", "1", "@x", "REDUCE", "MEDIAN", "1", "@x"])
        )
        .is_err());
        assert!(AggregateCommand::parse(&schema, &argv(&["*", "BOGUS"])).is_err());
    }

    #[test]
    fn apply_chain_references_prior_output() {
        let schema = schema();
        let args = argv(&[
            "*", "LOAD", "1", "@x", "APPLY", "@x + 1", "AS", "y", "APPLY", "@y * 2", "AS", "z",
        ]);
        let command = AggregateCommand::parse(&schema, &args).unwrap();
        assert_eq!(command.attributes.slot_of("z"), Some(2));
    }
}
