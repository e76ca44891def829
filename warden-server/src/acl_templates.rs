use std::future::Future;

use minijinja::{context, Environment, ErrorKind, UndefinedBehavior, Value};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, ErrorType};

/// The identity snapshot exposed to ACL templates.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TemplateContext {
    pub user: ContextUser,
    pub groups: Vec<ContextGroup>,
    pub tenants: Vec<ContextTenant>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContextUser {
    pub uuid: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContextGroup {
    pub uuid: Uuid,
    pub name: String,
    pub users: Vec<ContextUser>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContextTenant {
    pub uuid: Uuid,
    pub name: Option<String>,
}

/// Renders a set of ACL templates without fetching the identity graph
/// until a template actually references it.
pub struct LazyTemplateRenderer {
    acl_templates: Vec<String>,
}

impl LazyTemplateRenderer {
    #[must_use]
    pub fn new(acl_templates: Vec<String>) -> Self {
        Self { acl_templates }
    }

    /// Render every template and collect the non-empty output lines.
    ///
    /// Each template is first rendered against an empty context with
    /// strict undefined handling. The first undefined reference triggers
    /// `get_data` exactly once; a template that still hits an undefined
    /// name after that yields no ACLs. Any other template error aborts
    /// the whole render.
    pub async fn render<F, Fut>(self, get_data: F) -> Result<Vec<String>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TemplateContext, Error>>,
    {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let mut get_data = Some(get_data);
        let mut data: Option<Value> = None;
        let mut acls = Vec::new();

        for acl_template in &self.acl_templates {
            let template = env
                .template_from_str(acl_template)
                .map_err(ErrorType::Template)?;

            let ctx = data.clone().unwrap_or_else(|| context! {});
            match template.render(&ctx) {
                Ok(rendered) => collect_acls(&mut acls, &rendered),
                Err(err) if err.kind() == ErrorKind::UndefinedError => {
                    // The context is only fetched when a template needs it,
                    // and at most once.
                    let Some(get_data) = get_data.take() else {
                        continue;
                    };
                    let fetched = Value::from_serialize(&get_data().await?);
                    match template.render(&fetched) {
                        Ok(rendered) => collect_acls(&mut acls, &rendered),
                        Err(err) if err.kind() == ErrorKind::UndefinedError => {}
                        Err(err) => return Err(ErrorType::Template(err).into()),
                    }
                    data = Some(fetched);
                }
                Err(err) => return Err(ErrorType::Template(err).into()),
            }
        }

        Ok(acls)
    }
}

fn collect_acls(acls: &mut Vec<String>, rendered: &str) {
    for line in rendered.split('\n') {
        if !line.is_empty() {
            acls.push(line.to_string());
        }
    }
}
