use crate::model::{slugify, PageId, ProjectId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

/// Input model for creating a new project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "crate::model::double_option")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub project_id: ProjectId,
    pub name: String,
    pub slug: String,
    pub order: i32,
    pub created_at: DateTime<Utc>,
}

/// Input model for creating a page; the slug is derived from the name when omitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPage {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub order: Option<i32>,
}

impl NewPage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: None,
            order: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn resolved_slug(&self) -> String {
        match &self.slug {
            Some(slug) => slug.trim().to_string(),
            None => slugify(&self.name),
        }
    }
}
