use std::path::Path;

use crate::detect::is_gradle;
use crate::Language;

const APT_GIT: &str = "ENV DEBIAN_FRONTEND=noninteractive
RUN apt-get update && apt-get install -y \\
    git \\
    && rm -rf /var/lib/apt/lists/*
";

/// Dockerfile template for `language`, specialised by what the tree contains.
/// `None` for [`Language::Unknown`].
pub fn generate_dockerfile(language: Language, repo_root: &Path) -> Option<String> {
    match language {
        Language::Python => Some(python(repo_root)),
        Language::Node => Some(node(repo_root)),
        Language::Java => Some(java(repo_root)),
        Language::Go => Some(go()),
        Language::Unknown => None,
    }
}

fn python(repo_root: &Path) -> String {
    let mut out = String::from("FROM python:3.11-slim\n\nWORKDIR /app\n\n");
    out.push_str(APT_GIT);
    out.push_str("\nCOPY . /app\n\n");
    if repo_root.join("requirements.txt").is_file() {
        out.push_str("RUN pip install --no-cache-dir -r requirements.txt\n\n");
    }
    if repo_root.join("setup.py").is_file() {
        out.push_str("RUN pip install -e .\n\n");
    }
    out.push_str("EXPOSE 8000 8888\n\nCMD [\"python\", \"-m\", \"http.server\", \"8000\"]\n");
    out
}

fn node(repo_root: &Path) -> String {
    let has_package_json = repo_root.join("package.json").is_file();
    let has_yarn_lock = repo_root.join("yarn.lock").is_file();

    let mut out = String::from("FROM node:20-slim\n\nWORKDIR /app\n\n");
    out.push_str(APT_GIT);
    out.push('\n');
    if has_package_json {
        out.push_str("COPY package*.json ./\n");
        if has_yarn_lock {
            out.push_str("COPY yarn.lock ./\n");
        }
    }
    out.push_str("\nCOPY . /app\n\n");
    if has_package_json {
        if has_yarn_lock {
            out.push_str("RUN yarn install\n\n");
        } else {
            out.push_str("RUN npm install\n\n");
        }
    }
    out.push_str("EXPOSE 3000 8080\n\nCMD [\"npm\", \"start\"]\n");
    out
}

fn java(repo_root: &Path) -> String {
    let runtime_stage = |artifacts: &str| {
        format!(
            "FROM openjdk:17-slim\n\nWORKDIR /app\n\nCOPY --from=build {artifacts} app.jar\n\n\
             EXPOSE 8080\n\nCMD [\"java\", \"-jar\", \"app.jar\"]\n"
        )
    };

    if is_gradle(repo_root) {
        let mut out = String::from(
            "FROM gradle:8-jdk17 AS build\n\nWORKDIR /app\n\n\
             COPY build.gradle* settings.gradle* gradlew* ./\n",
        );
        if repo_root.join("gradle").is_dir() {
            out.push_str("COPY gradle ./gradle\n");
        }
        out.push_str("\nCOPY . /app\n\nRUN gradle build --no-daemon\n\n");
        out.push_str(&runtime_stage("/app/build/libs/*.jar"));
        out
    } else if repo_root.join("pom.xml").is_file() {
        let mut out = String::from(
            "FROM maven:3-openjdk-17 AS build\n\nWORKDIR /app\n\nCOPY pom.xml ./\n\n\
             COPY . /app\n\nRUN mvn clean package -DskipTests\n\n",
        );
        out.push_str(&runtime_stage("/app/target/*.jar"));
        out
    } else {
        "FROM openjdk:17-slim\n\nWORKDIR /app\n\nCOPY . /app\n\nEXPOSE 8080\n\nCMD [\"bash\"]\n"
            .to_string()
    }
}

fn go() -> String {
    "FROM golang:1.21-alpine AS build

WORKDIR /app

COPY go.* ./
RUN go mod download

COPY . /app
RUN CGO_ENABLED=0 GOOS=linux go build -o main .

FROM alpine:latest

WORKDIR /app
COPY --from=build /app/main .

EXPOSE 8080

CMD [\"./main\"]
"
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn python_template_installs_requirements_and_package() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask").unwrap();
        fs::write(dir.path().join("setup.py"), "").unwrap();

        let dockerfile = generate_dockerfile(Language::Python, dir.path()).unwrap();
        assert!(dockerfile.starts_with("FROM python:3.11-slim"));
        assert!(dockerfile.contains("pip install --no-cache-dir -r requirements.txt"));
        assert!(dockerfile.contains("pip install -e ."));
    }

    #[test]
    fn node_template_prefers_yarn_when_locked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("yarn.lock"), "").unwrap();

        let dockerfile = generate_dockerfile(Language::Node, dir.path()).unwrap();
        assert!(dockerfile.contains("COPY yarn.lock ./"));
        assert!(dockerfile.contains("RUN yarn install"));
        assert!(!dockerfile.contains("npm install"));
    }

    #[test]
    fn node_template_without_manifest_skips_install() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = generate_dockerfile(Language::Node, dir.path()).unwrap();
        assert!(!dockerfile.contains("install\n"));
        assert!(dockerfile.contains("CMD [\"npm\", \"start\"]"));
    }

    #[test]
    fn java_template_follows_build_tool() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        let maven = generate_dockerfile(Language::Java, dir.path()).unwrap();
        assert!(maven.starts_with("FROM maven:3-openjdk-17 AS build"));
        assert!(maven.contains("COPY --from=build /app/target/*.jar app.jar"));

        fs::write(dir.path().join("build.gradle"), "").unwrap();
        let gradle = generate_dockerfile(Language::Java, dir.path()).unwrap();
        assert!(gradle.starts_with("FROM gradle:8-jdk17 AS build"));
        assert!(!gradle.contains("COPY gradle ./gradle"));

        let plain = tempfile::tempdir().unwrap();
        let jdk = generate_dockerfile(Language::Java, plain.path()).unwrap();
        assert!(jdk.starts_with("FROM openjdk:17-slim"));
        assert!(jdk.contains("CMD [\"bash\"]"));
    }

    #[test]
    fn unknown_language_has_no_template() {
        let dir = tempfile::tempdir().unwrap();
        assert!(generate_dockerfile(Language::Unknown, dir.path()).is_none());
    }
}
