//! Built-in `counter` actor served by the host binary.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actors::{ActorDefinition, ActorError, DefinitionError};
use crate::config::InstanceOptions;

pub const COUNTER: &str = "counter";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub count: i64,
}

/// `increment(by?)` adds to the count and broadcasts `newCount` to
/// subscribers. `getCount()` reads it.
pub fn counter_definition(options: InstanceOptions) -> Result<ActorDefinition<CounterState>, DefinitionError> {
    ActorDefinition::builder(COUNTER)
        .state(CounterState::default())
        .options(options)
        .action_sync("increment", |ctx, args| {
            let by = match args.first() {
                None | Some(Value::Null) => 1,
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| ActorError::user("invalid_argument", "increment expects an integer"))?,
            };
            let count = ctx.mutate(|s| {
                s.count += by;
                s.count
            })?;
            ctx.broadcast("newCount", vec![json!(count)]);
            Ok(json!(count))
        })
        .action_sync("getCount", |ctx, _| Ok(json!(ctx.state().count)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_definition_lists_actions() {
        let definition = counter_definition(InstanceOptions::default()).unwrap();
        assert_eq!(definition.name(), COUNTER);
        assert!(definition.has_action("increment"));
        assert!(definition.has_action("getCount"));
        assert!(!definition.has_action("reset"));
    }
}
