use std::fmt;

/// One entry of a token scope set, e.g. `repository:test1/foo:pull,push`
/// or `keppel_account:test1:view`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub resource_type: String,
    pub resource_name: String,
    pub actions: Vec<String>,
}

impl Scope {
    pub fn repository(name: &str, actions: &[&str]) -> Self {
        Self {
            resource_type: "repository".to_string(),
            resource_name: name.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn account_view(account: &str) -> Self {
        Self {
            resource_type: "keppel_account".to_string(),
            resource_name: account.to_string(),
            actions: vec!["view".to_string()],
        }
    }

    /// Parses `type:name:action1,action2`. The name may itself contain
    /// colons only in the type-less catalog form, which we do not use, so
    /// a simple three-way split suffices.
    pub fn parse(s: &str) -> Option<Self> {
        let (resource_type, rest) = s.split_once(':')?;
        let (resource_name, actions) = rest.rsplit_once(':')?;
        if resource_type.is_empty() || resource_name.is_empty() {
            return None;
        }
        Some(Self {
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            actions: actions
                .split(',')
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.resource_name,
            self.actions.join(",")
        )
    }
}

/// The scopes granted to a request, after token validation.
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    pub fn new(scopes: Vec<Scope>) -> Self {
        Self { scopes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    pub fn contains(&self, resource_type: &str, resource_name: &str, action: &str) -> bool {
        self.scopes.iter().any(|s| {
            s.resource_type == resource_type
                && s.resource_name == resource_name
                && s.actions.iter().any(|a| a == action)
        })
    }

    /// Whether every action of `required` is granted.
    pub fn covers(&self, required: &Scope) -> bool {
        required.actions.iter().all(|action| {
            self.contains(&required.resource_type, &required.resource_name, action)
        })
    }

    /// Account names this token may list in the catalog.
    pub fn accounts_with_view(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .scopes
            .iter()
            .filter(|s| {
                s.resource_type == "keppel_account" && s.actions.iter().any(|a| a == "view")
            })
            .map(|s| s.resource_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let scope = Scope::parse("repository:test1/foo:pull,push").unwrap();
        assert_eq!(scope.resource_type, "repository");
        assert_eq!(scope.resource_name, "test1/foo");
        assert_eq!(scope.actions, vec!["pull", "push"]);
        assert_eq!(scope.to_string(), "repository:test1/foo:pull,push");

        assert!(Scope::parse("nonsense").is_none());
        assert!(Scope::parse(":x:pull").is_none());
    }

    #[test]
    fn test_covers() {
        let granted = ScopeSet::new(vec![Scope::repository("test1/foo", &["pull", "push"])]);
        assert!(granted.covers(&Scope::repository("test1/foo", &["pull"])));
        assert!(granted.covers(&Scope::repository("test1/foo", &["pull", "push"])));
        assert!(!granted.covers(&Scope::repository("test1/foo", &["delete"])));
        assert!(!granted.covers(&Scope::repository("test1/bar", &["pull"])));
    }

    #[test]
    fn test_accounts_with_view() {
        let granted = ScopeSet::new(vec![
            Scope::account_view("bravo"),
            Scope::account_view("alpha"),
            Scope::repository("zulu/foo", &["pull"]),
            Scope::account_view("alpha"),
        ]);
        assert_eq!(granted.accounts_with_view(), vec!["alpha", "bravo"]);
    }
}
