use std::fmt;

use reqwest::{Method, Url};

use crate::rest::RestError;

/// Rate-limit classification of a call: method plus path template.
///
/// Path parameters are deliberately absent so that ids never split a bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey {
    method: Method,
    template: &'static str,
}

impl RouteKey {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &'static str {
        self.template
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// One HTTP call target: template with `{name}` placeholders filled in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: &'static str,
    params: Vec<String>,
    query: Vec<(String, String)>,
}

impl Route {
    pub fn new(method: Method, template: &'static str) -> Self {
        Self {
            method,
            template,
            params: Vec::new(),
            query: Vec::new(),
        }
    }

    pub fn get(template: &'static str) -> Self {
        Self::new(Method::GET, template)
    }

    pub fn post(template: &'static str) -> Self {
        Self::new(Method::POST, template)
    }

    pub fn put(template: &'static str) -> Self {
        Self::new(Method::PUT, template)
    }

    pub fn patch(template: &'static str) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub fn delete(template: &'static str) -> Self {
        Self::new(Method::DELETE, template)
    }

    /// Supplies the next path parameter.
    pub fn param(mut self, value: impl fmt::Display) -> Self {
        self.params.push(value.to_string());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn key(&self) -> RouteKey {
        RouteKey {
            method: self.method.clone(),
            template: self.template,
        }
    }

    /// Path segments with parameters substituted, unencoded.
    pub fn segments(&self) -> Result<Vec<String>, RestError> {
        let mut params = self.params.iter();
        let mut segments = Vec::new();
        for part in self.template.split('/').filter(|part| !part.is_empty()) {
            if part.starts_with('{') && part.ends_with('}') {
                let value = params.next().ok_or_else(|| {
                    RestError::InvalidRoute(format!("missing {part} for {}", self.template))
                })?;
                segments.push(value.clone());
            } else {
                segments.push(part.to_string());
            }
        }
        if params.next().is_some() {
            return Err(RestError::InvalidRoute(format!(
                "too many parameters for {}",
                self.template
            )));
        }
        Ok(segments)
    }

    /// Resolves the route against `base`, percent-encoding each segment.
    pub fn url(&self, base: &str) -> Result<Url, RestError> {
        let mut url = Url::parse(base).map_err(|err| RestError::InvalidRoute(err.to_string()))?;
        let segments = self.segments()?;
        url.path_segments_mut()
            .map_err(|_| RestError::InvalidRoute(format!("base url cannot hold a path: {base}")))?
            .pop_if_empty()
            .extend(segments);
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}
