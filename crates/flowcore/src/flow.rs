use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

pub type ActionId = String;

/// Complete flow definition: the immutable graph one runtime executes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Flow {
    pub code: String,
    pub name: String,
    pub flow_type: String,
    /// Suggested run deadline in milliseconds
    #[serde(deserialize_with = "de_millis")]
    pub timeout: Option<u64>,
    pub params: Vec<FlowParam>,
    pub dict: Vec<FlowDict>,
    pub actions: Vec<Action>,
    pub links: Vec<Link>,
    pub groups: Vec<Group>,
}

impl Flow {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_action(&mut self, action: Action) -> ActionId {
        let id = action.id.clone();
        self.actions.push(action);
        id
    }

    /// Add an active, unguarded link.
    pub fn connect(&mut self, source_id: impl Into<String>, target_id: impl Into<String>) {
        self.links.push(Link::new(source_id, target_id));
    }

    pub fn add_link(&mut self, link: Link) {
        self.links.push(link);
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn link(&self, source_id: &str, target_id: &str) -> Option<&Link> {
        self.links
            .iter()
            .find(|l| l.source_id == source_id && l.target_id == target_id)
    }

    /// Outgoing links of an action, active or not.
    pub fn links_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| l.source_id == id)
    }

    /// Incoming links of an action, active or not.
    pub fn links_to<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| l.target_id == id)
    }

    /// Actions without any incoming link.
    pub fn start_action_ids(&self) -> Vec<ActionId> {
        self.actions
            .iter()
            .filter(|a| self.links_to(&a.id).next().is_none())
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == group_id)
    }

    /// Members of a group that resolve to an action.
    pub fn action_ids_in_group(&self, group_id: &str) -> Vec<ActionId> {
        self.group(group_id)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| self.action(m).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Group members without any incoming link.
    pub fn start_action_ids_in_group(&self, group_id: &str) -> Vec<ActionId> {
        self.group(group_id)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| self.action(m).is_some() && self.links_to(m).next().is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dict(&self, name: &str) -> Option<&FlowDict> {
        self.dict.iter().find(|d| d.name == name)
    }
}

/// One node of the flow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Action {
    pub id: ActionId,
    /// Runner type the registry resolves
    pub name: String,
    pub title: String,
    pub des: String,
    pub icon: String,
    /// Wait for every active incoming link before running
    #[serde(deserialize_with = "de_flag")]
    pub collect: bool,
    /// Declared only; the session does not enforce it
    #[serde(deserialize_with = "de_flag")]
    pub once: bool,
    pub iterator_list: String,
    pub iterator_item: String,
    pub script_before: String,
    pub script_after: String,
    pub script_error: String,
    pub params: HashMap<String, String>,
    pub content: Option<ActionContent>,
}

impl Action {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_collect(mut self, collect: bool) -> Self {
        self.collect = collect;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_filter(mut self, script: impl Into<String>) -> Self {
        self.script_before = script.into();
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script_after = script.into();
        self
    }

    pub fn with_error_script(mut self, script: impl Into<String>) -> Self {
        self.script_error = script.into();
        self
    }

    pub fn with_iterator(mut self, list: impl Into<String>, item: impl Into<String>) -> Self {
        self.iterator_list = list.into();
        self.iterator_item = item.into();
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Display payload of an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionContent {
    pub content_type: String,
    pub content: String,
}

/// Directed edge between two actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub name: String,
    pub title: String,
    pub source_id: ActionId,
    pub target_id: ActionId,
    /// Guard script
    pub filter: String,
    #[serde(deserialize_with = "de_active")]
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            name: String::new(),
            title: String::new(),
            source_id: String::new(),
            target_id: String::new(),
            filter: String::new(),
            active: true,
        }
    }
}

impl Link {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, script: impl Into<String>) -> Self {
        self.filter = script.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Named subset of action ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: String,
    pub title: String,
    pub des: String,
    pub members: Vec<ActionId>,
}

/// Declared run parameter with its default value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParam {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowDict {
    pub name: String,
    pub label: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Opt-in flag: only `true` or a `"true"` string (any case) turns it on.
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Bool(b)) => b,
        Some(Loose::Text(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(Loose::Number(n)) => n != 0.0,
        None => false,
    })
}

/// Opt-out flag: on unless written as `false` or `"false"`.
fn de_active<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Bool(b)) => b,
        Some(Loose::Text(s)) => !s.trim().eq_ignore_ascii_case("false"),
        Some(Loose::Number(n)) => n != 0.0,
        None => true,
    })
}

fn de_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Number(n)) if n > 0.0 => Some(n as u64),
        Some(Loose::Text(s)) => s.trim().parse::<u64>().ok().filter(|ms| *ms > 0),
        _ => None,
    })
}
