use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

#[derive(Debug)]
struct Filter {
    module: Option<String>,
    level: Level,
}

impl Filter {
    #[inline]
    pub fn match_module(&self, module: &str) -> Option<&Self> {
        self.module.as_ref().map_or(Some(self), |prefix| {
            module.starts_with(prefix).then(|| self)
        })
    }

    #[inline]
    pub fn match_level(&self, level: Level) -> bool {
        level.is_at_least(self.level)
    }
}

struct Directives(Vec<Filter>);

impl Directives {
    #[inline]
    pub fn is_enabled(&self, module: &str, level: Level) -> bool {
        // Find the last-match filter and check the allowed level
        self.0
            .iter()
            .filter_map(|filter| filter.match_module(module))
            .last()
            .map(|filter| filter.match_level(level))
            .unwrap_or_default()
    }
}

/// Parse filter to be a list of valid prefix strings.
///
/// `module=level` or `level` where the module is a valid module
/// prefix and the level a supported level name (`critical`, `error`,
/// `warn`, `info`, `debug`, `trace`).
///
/// This method does not fail as it will ignore invalid directives.
impl From<&str> for Directives {
    fn from(filter: &str) -> Self {
        let filters = filter
            .split(',')
            .map(str::trim)
            .filter_map(|filter| {
                let kv = filter.split('=').collect::<Vec<_>>();
                let (module, level) = match kv[..] {
                    [level] => (None, level),
                    [module, level] if is_module_path(module) => (Some(module.to_string()), level),
                    _ => return None,
                };
                Level::from_str(level)
                    .ok()
                    .map(|level| Filter { module, level })
            })
            .collect();

        Self(filters)
    }
}

fn is_module_path(module: &str) -> bool {
    module
        .chars()
        .all(|c| matches!(c, '0'..='9' | 'a'..='z' | 'A'..='Z' | ':' | '_'))
}

pub struct Logger<T: Drain> {
    drain: T,
    directives: Directives,
}

impl<T: Drain> Logger<T> {
    /// `RUST_LOG` takes precedence over the supplied filter.
    pub fn with_default_filter(drain: T, filter: &str) -> Self {
        let filter = env::var("RUST_LOG")
            .ok()
            .unwrap_or_else(|| filter.to_string());

        Self {
            drain,
            directives: filter.as_str().into(),
        }
    }
}

impl<T: Drain> Drain for Logger<T>
where
    T: Drain<Ok = ()>,
{
    type Err = T::Err;
    type Ok = ();

    fn log(&self, info: &Record<'_>, val: &OwnedKVList) -> Result<(), T::Err> {
        if !self.directives.is_enabled(info.module(), info.level()) {
            return Ok(());
        }

        self.drain.log(info, val)
    }
}
