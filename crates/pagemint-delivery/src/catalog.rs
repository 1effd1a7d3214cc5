//! Product Catalog
//!
//! The closed set of template packs PageMint sells, and the files each one
//! delivers. Unknown product ids fail to parse instead of mapping to an
//! empty bundle.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{DeliveryError, Result};

/// Template pack tiers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Product {
    StarterPack,
    ProPack,
}

/// Kind of deliverable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Template,
    Guide,
    Assets,
    Design,
}

/// A file shipped as part of a template pack
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliverableFile {
    pub name: &'static str,
    pub size: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub storage_path: &'static str,
}

const STARTER_FILES: &[DeliverableFile] = &[
    DeliverableFile {
        name: "minimalist-clean.zip",
        size: "2.5 MB",
        description: "Minimalist Clean Template + Assets",
        kind: FileKind::Template,
        storage_path: "/downloads/starter/minimalist-clean.zip",
    },
    DeliverableFile {
        name: "gradient-startup.zip",
        size: "3.1 MB",
        description: "Gradient Startup Template + Assets",
        kind: FileKind::Template,
        storage_path: "/downloads/starter/gradient-startup.zip",
    },
    DeliverableFile {
        name: "setup-guide.pdf",
        size: "0.8 MB",
        description: "Quick Setup & Customization Guide",
        kind: FileKind::Guide,
        storage_path: "/downloads/starter/setup-guide.pdf",
    },
];

const PRO_FILES: &[DeliverableFile] = &[
    DeliverableFile {
        name: "all-templates.zip",
        size: "12.8 MB",
        description: "Complete Template Collection (5 Templates)",
        kind: FileKind::Template,
        storage_path: "/downloads/pro/all-templates-pack.zip",
    },
    DeliverableFile {
        name: "customization-guide.pdf",
        size: "1.2 MB",
        description: "Complete Customization Guide",
        kind: FileKind::Guide,
        storage_path: "/downloads/pro/customization-guide.pdf",
    },
    DeliverableFile {
        name: "bonus-assets.zip",
        size: "5.4 MB",
        description: "Premium Icons, Fonts & Graphics",
        kind: FileKind::Assets,
        storage_path: "/downloads/pro/bonus-assets.zip",
    },
    DeliverableFile {
        name: "figma-files.zip",
        size: "8.1 MB",
        description: "Figma Source Files (Design Files)",
        kind: FileKind::Design,
        storage_path: "/downloads/pro/figma-source-files.zip",
    },
];

impl Product {
    pub const ALL: [Product; 2] = [Product::StarterPack, Product::ProPack];

    /// Catalog identifier (`STARTER_PACK`, `PRO_PACK`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Product::StarterPack => "STARTER_PACK",
            Product::ProPack => "PRO_PACK",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Product::StarterPack => "Starter Pack",
            Product::ProPack => "Pro Pack",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Product::StarterPack => "Perfect for indie hackers - 2 Template Variations",
            Product::ProPack => "Best value for agencies - All 5 Template Variations",
        }
    }

    /// One-time price in cents (USD)
    pub fn price_cents(&self) -> i64 {
        match self {
            Product::StarterPack => 2900,
            Product::ProPack => 5900,
        }
    }

    /// Ordered list of deliverable files
    pub fn files(&self) -> &'static [DeliverableFile] {
        match self {
            Product::StarterPack => STARTER_FILES,
            Product::ProPack => PRO_FILES,
        }
    }

    /// Files to deliver, failing if the bundle is empty
    pub fn deliverables(&self) -> Result<&'static [DeliverableFile]> {
        let files = self.files();
        if files.is_empty() {
            return Err(DeliveryError::NoDeliverables(*self));
        }
        Ok(files)
    }

    /// Look up a file of this bundle by its public name
    pub fn file(&self, name: &str) -> Option<&'static DeliverableFile> {
        self.files().iter().find(|f| f.name == name)
    }

    pub fn download_instructions(&self) -> &'static [&'static str] {
        match self {
            Product::StarterPack => &[
                "Click the download buttons below to save all files",
                "Extract the ZIP files to your project folder",
                "Open any template's index.html in your browser",
                "Follow the included setup guide for customization",
                "Deploy using Vercel, Netlify, or any static host",
            ],
            Product::ProPack => &[
                "Download all files using the buttons below",
                "Extract all ZIP archives to your project folder",
                "Review the comprehensive customization guide (PDF)",
                "Choose your favorite template and start customizing",
                "Use the bonus assets and Figma files for advanced customization",
                "Deploy following the included deployment guide",
            ],
        }
    }
}

/// Tips appended to every delivery email
pub const TROUBLESHOOTING_TIPS: &[&str] = &[
    "Download issues? Try right-clicking links and 'Save As'",
    "Some browsers block multiple downloads - try one at a time",
    "Mobile downloads? Use a desktop/laptop for best experience",
];

impl FromStr for Product {
    type Err = DeliveryError;

    /// Accepts `PRO_PACK`, `pro-pack`, `pro_pack` and the short `pro` form
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "starter_pack" | "starter" => Ok(Product::StarterPack),
            "pro_pack" | "pro" => Ok(Product::ProPack),
            _ => Err(DeliveryError::UnknownProduct(s.to_string())),
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pro_pack_has_four_files() {
        let files = Product::ProPack.deliverables().unwrap();
        assert_eq!(files.len(), 4);
        assert_eq!(files[0].name, "all-templates.zip");
        assert_eq!(files[3].kind, FileKind::Design);
    }

    #[test]
    fn test_starter_pack_order() {
        let names: Vec<_> = Product::StarterPack.files().iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            vec!["minimalist-clean.zip", "gradient-startup.zip", "setup-guide.pdf"]
        );
    }

    #[test]
    fn test_parse_product_ids() {
        assert_eq!("PRO_PACK".parse::<Product>().unwrap(), Product::ProPack);
        assert_eq!("pro-pack".parse::<Product>().unwrap(), Product::ProPack);
        assert_eq!("starter".parse::<Product>().unwrap(), Product::StarterPack);
    }

    #[test]
    fn test_unknown_product_is_an_error() {
        let err = "ENTERPRISE_PACK".parse::<Product>().unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownProduct(id) if id == "ENTERPRISE_PACK"));
    }

    #[test]
    fn test_file_lookup() {
        assert!(Product::ProPack.file("figma-files.zip").is_some());
        assert!(Product::StarterPack.file("figma-files.zip").is_none());
    }

    #[test]
    fn test_serde_uses_catalog_ids() {
        let json = serde_json::to_string(&Product::StarterPack).unwrap();
        assert_eq!(json, "\"STARTER_PACK\"");
    }
}
