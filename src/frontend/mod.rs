pub mod lexer;
pub mod preprocessor;
pub mod token;
pub mod token_dumper;
