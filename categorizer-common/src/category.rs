use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of tags kept on a classification.
pub const MAX_TAGS: usize = 5;

/// The closed set of main categories a project can be assigned to.
///
/// The serialized labels are part of the wire contract with downstream consumers
/// (search indexing), so they must not change. [`Category::Other`] is the catch-all
/// and is always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Desarrollo de Software")]
    SoftwareDevelopment,
    #[serde(rename = "Diseño Gráfico y Multimedia")]
    GraphicDesign,
    #[serde(rename = "Marketing Digital y SEO")]
    DigitalMarketing,
    #[serde(rename = "Redacción y Traducción")]
    WritingAndTranslation,
    #[serde(rename = "Soporte Administrativo")]
    AdministrativeSupport,
    #[serde(rename = "Consultoría y Negocios")]
    ConsultingAndBusiness,
    #[serde(rename = "Other")]
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::SoftwareDevelopment,
        Category::GraphicDesign,
        Category::DigitalMarketing,
        Category::WritingAndTranslation,
        Category::AdministrativeSupport,
        Category::ConsultingAndBusiness,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SoftwareDevelopment => "Desarrollo de Software",
            Category::GraphicDesign => "Diseño Gráfico y Multimedia",
            Category::DigitalMarketing => "Marketing Digital y SEO",
            Category::WritingAndTranslation => "Redacción y Traducción",
            Category::AdministrativeSupport => "Soporte Administrativo",
            Category::ConsultingAndBusiness => "Consultoría y Negocios",
            Category::Other => "Other",
        }
    }

    /// Exact, case-sensitive lookup of a label in the set.
    pub fn from_label(label: &str) -> Option<Category> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == label)
    }

    /// The labels joined for interpolation into a classification prompt.
    pub fn prompt_list() -> String {
        Category::ALL
            .iter()
            .map(Category::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated classification: the category is always in the set and there are at
/// most [`MAX_TAGS`] tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub main_category: Category,
    pub tags: Vec<String>,
}

impl ClassificationResult {
    pub fn new(main_category: Category, mut tags: Vec<String>) -> Self {
        tags.truncate(MAX_TAGS);
        Self {
            main_category,
            tags,
        }
    }

    /// Returned whenever the classification backend could not produce a usable answer.
    pub fn fallback() -> Self {
        Self {
            main_category: Category::Other,
            tags: Vec::new(),
        }
    }
}
