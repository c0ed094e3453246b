//! Environment profile catalog.
//!
//! Profiles are labels recorded on a VM; the catalog only describes them.
//! Unknown names are accepted.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub packages: &'static [&'static str],
}

pub const PROFILES: &[Profile] = &[
    Profile {
        name: "bioxen-minimal",
        category: "biology",
        description: "Minimal BioXen environment with core biological tools",
        packages: &["lua-cjson", "luafilesystem", "bio-utils"],
    },
    Profile {
        name: "bioxen-standard",
        category: "biology",
        description: "Standard BioXen environment with common analysis tools and AI interface",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "bio-utils",
            "sequence-parser",
            "phylo-tree",
            "gabby-lua",
        ],
    },
    Profile {
        name: "bioxen-full",
        category: "biology",
        description: "Full BioXen environment with all biological tools, AI interface and SDR support",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "bio-utils",
            "sequence-parser",
            "phylo-tree",
            "blast-parser",
            "genome-tools",
            "protein-fold",
            "gabby-lua",
            "lua-radio",
            "penlight",
        ],
    },
    Profile {
        name: "bioxen-ai",
        category: "ai-biology",
        description: "AI-focused BioXen environment with conversational interface and basic bio tools",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "gabby-lua",
            "bio-utils",
            "sequence-parser",
            "penlight",
        ],
    },
    Profile {
        name: "bioxen-radio",
        category: "radio",
        description: "Software-defined radio environment for communication protocols",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "lua-radio",
            "lua-messagepack",
            "penlight",
        ],
    },
    Profile {
        name: "minimal",
        category: "general",
        description: "Minimal Lua environment with basic utilities",
        packages: &["lua-cjson", "luafilesystem"],
    },
    Profile {
        name: "standard",
        category: "general",
        description: "Standard Lua environment with common utilities",
        packages: &["lua-cjson", "luafilesystem", "luasocket", "penlight"],
    },
    Profile {
        name: "full",
        category: "general",
        description: "Full-featured Lua environment with extensive library support",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "penlight",
            "lpeg",
            "lua-curl",
            "lua-messagepack",
            "lua-yaml",
            "lua-term",
            "luaposix",
        ],
    },
    Profile {
        name: "network",
        category: "networking",
        description: "Network-focused environment for distributed applications",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "lua-curl",
            "lua-messagepack",
            "penlight",
        ],
    },
    Profile {
        name: "development",
        category: "development",
        description: "Development environment with debugging and system tools",
        packages: &[
            "lua-cjson",
            "luafilesystem",
            "luasocket",
            "penlight",
            "lpeg",
            "lua-term",
            "luaposix",
        ],
    },
];

pub fn find(name: &str) -> Option<&'static Profile> {
    PROFILES.iter().find(|p| p.name == name)
}

pub fn is_known(name: &str) -> bool {
    find(name).is_some()
}

/// Renders the catalog as a table.
pub fn render_catalog() -> String {
    let name_width = PROFILES.iter().map(|p| p.name.len()).max().unwrap_or(7).max(7);
    let category_width = PROFILES
        .iter()
        .map(|p| p.category.len())
        .max()
        .unwrap_or(8)
        .max(8);

    let mut out = format!(
        "{:<name_width$}  {:<category_width$}  {:>4}  {}\n",
        "PROFILE", "CATEGORY", "PKGS", "DESCRIPTION"
    );
    out.push_str(&"-".repeat(name_width + category_width + 8 + 11));
    out.push('\n');

    for profile in PROFILES {
        out.push_str(&format!(
            "{:<name_width$}  {:<category_width$}  {:>4}  {}\n",
            profile.name,
            profile.category,
            profile.packages.len(),
            profile.description
        ));
    }
    out
}
